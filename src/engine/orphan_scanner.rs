// ==========================================
// FWC 对账引擎 - 孤儿核销扫描
// ==========================================
// 定义: 批次售票日期范围内的内部核销,其卡号与会员证件号
//       都未出现在该批次任何外部记录中（精确比对）
// 性质: 提示信息,不影响批次 matched/unmatched 计数
// ==========================================

use crate::domain::reconciliation::OrphanInternalRecord;
use crate::domain::types::BatchStatus;
use crate::engine::error::{ReconcileError, ReconcileResult};
use crate::engine::reference_index::ReferenceIndex;
use crate::repository::ReconciliationRepository;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct OrphanScanner {
    recon_repo: Arc<ReconciliationRepository>,
    index: Arc<dyn ReferenceIndex>,
}

impl OrphanScanner {
    pub fn new(recon_repo: Arc<ReconciliationRepository>, index: Arc<dyn ReferenceIndex>) -> Self {
        Self { recon_repo, index }
    }

    /// 查找批次的孤儿核销
    ///
    /// # 参数
    /// - batch_id: 批次ID（必须为 COMPLETED）
    /// - limit: 返回上限（按班次日期升序截取）
    pub fn find_orphans(
        &self,
        batch_id: &str,
        limit: usize,
    ) -> ReconcileResult<Vec<OrphanInternalRecord>> {
        let batch = self
            .recon_repo
            .find_batch(batch_id)?
            .ok_or_else(|| ReconcileError::BatchNotFound(batch_id.to_string()))?;
        if batch.status != BatchStatus::Completed {
            return Err(ReconcileError::BatchNotCompleted {
                batch_id: batch_id.to_string(),
                status: batch.status,
            });
        }

        let records = self.recon_repo.load_external_records(batch_id)?;
        let (start, end) = match (
            records.iter().map(|r| r.ticketing_date).min(),
            records.iter().map(|r| r.ticketing_date).max(),
        ) {
            (Some(start), Some(end)) => (start, end),
            _ => return Ok(Vec::new()),
        };

        let serials: HashSet<&str> = records
            .iter()
            .filter(|r| r.has_serial())
            .map(|r| r.cleaned_serial_code.as_str())
            .collect();
        let identities: HashSet<&str> = records.iter().map(|r| r.identity_number.as_str()).collect();

        let candidates = self.index.find_redemptions_in_range(start, end)?;
        let scanned = candidates.len();

        let orphans: Vec<OrphanInternalRecord> = candidates
            .into_iter()
            .filter(|view| {
                let serial_seen = view
                    .serial_number
                    .as_deref()
                    .map(|s| serials.contains(s))
                    .unwrap_or(false);
                let identity_seen = view
                    .member_nik
                    .as_deref()
                    .map(|nik| identities.contains(nik))
                    .unwrap_or(false);
                !serial_seen && !identity_seen
            })
            .take(limit)
            .map(|view| OrphanInternalRecord {
                card_id: view.redemption.card_id,
                serial_number: view.serial_number,
                member_name: view.member_name,
                member_nik: view.member_nik,
                redeem_id: view.redemption.redeem_id,
                redeem_date: view.redemption.shift_date,
                redeem_station: view.redemption.station_name,
                redeem_type: view.redemption.redeem_type,
            })
            .collect();

        debug!(
            batch_id = %batch_id,
            start = %start,
            end = %end,
            scanned,
            orphans = orphans.len(),
            "孤儿核销扫描完成"
        );
        Ok(orphans)
    }
}
