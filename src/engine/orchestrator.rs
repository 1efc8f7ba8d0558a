// ==========================================
// FWC 对账引擎 - 批次编排器
// ==========================================
// 生命周期: PENDING → MATCHING → {COMPLETED | FAILED}
// 流程: CAS 进入 MATCHING → 装载参考快照 → 并行匹配 → 分段落库 → 汇总计数
// 失败策略: 已写入的匹配结果不回滚,批次置 FAILED 并上报
// ==========================================

use crate::domain::reconciliation::{ExternalRecord, MatchOutcome, ReconciliationBatch};
use crate::engine::error::{ReconcileError, ReconcileResult};
use crate::engine::matcher::Matcher;
use crate::engine::reference_index::ReferenceSnapshot;
use crate::repository::{ReconciliationRepository, ReferenceRepository};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// 每次落库的结果行数
const PERSIST_CHUNK_ROWS: usize = 500;

/// 匹配运行参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingOptions {
    /// 并行匹配的工作线程数（至少 1）
    pub workers: usize,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// 运行中断信息
#[derive(Debug)]
struct RunFailure {
    processed_rows: usize,
    message: String,
}

impl RunFailure {
    fn new(processed_rows: usize, err: impl std::fmt::Display) -> Self {
        Self {
            processed_rows,
            message: err.to_string(),
        }
    }
}

// ==========================================
// BatchOrchestrator - 批次编排器
// ==========================================
pub struct BatchOrchestrator {
    recon_repo: Arc<ReconciliationRepository>,
    reference_repo: Arc<ReferenceRepository>,
    matcher: Matcher,
    options: MatchingOptions,
}

impl BatchOrchestrator {
    pub fn new(
        recon_repo: Arc<ReconciliationRepository>,
        reference_repo: Arc<ReferenceRepository>,
        options: MatchingOptions,
    ) -> Self {
        Self {
            recon_repo,
            reference_repo,
            matcher: Matcher::default(),
            options,
        }
    }

    /// 执行批次匹配
    ///
    /// # 参数
    /// - batch_id: 批次ID
    /// - operator: 触发匹配的操作员（写入 matched_by）
    ///
    /// # 返回
    /// - Ok(ReconciliationBatch): COMPLETED 状态的批次
    /// - Err(BatchAlreadyMatched / BatchMatchingInProgress / BatchFailed / BatchNotFound): 未开始
    /// - Err(MatchingFailed): 运行中失败,批次已置 FAILED
    #[instrument(skip(self))]
    pub fn run_matching(
        &self,
        batch_id: &str,
        operator: Option<&str>,
    ) -> ReconcileResult<ReconciliationBatch> {
        let start_time = Instant::now();

        // === 步骤 1: PENDING → MATCHING ===
        if !self.recon_repo.try_begin_matching(batch_id, operator)? {
            let err = match self.recon_repo.find_batch(batch_id)? {
                None => ReconcileError::BatchNotFound(batch_id.to_string()),
                Some(batch) => ReconcileError::not_startable(batch_id, batch.status),
            };
            warn!(batch_id = %batch_id, error = %err, "批次无法开始匹配");
            return Err(err);
        }
        info!(batch_id = %batch_id, operator = ?operator, "批次进入 MATCHING");

        // === 步骤 2~5: 快照、匹配、落库、汇总 ===
        match self.execute(batch_id) {
            Ok(batch) => {
                info!(
                    batch_id = %batch_id,
                    total_rows = batch.total_rows,
                    matched = batch.matched_rows,
                    unmatched = batch.unmatched_rows,
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "批次匹配完成"
                );
                Ok(batch)
            }
            Err(failure) => {
                error!(
                    batch_id = %batch_id,
                    processed_rows = failure.processed_rows,
                    error = %failure.message,
                    "批次匹配失败"
                );
                if let Err(e) = self.recon_repo.fail_batch(batch_id, &failure.message) {
                    error!(batch_id = %batch_id, error = %e, "批次置 FAILED 失败");
                }
                Err(ReconcileError::MatchingFailed {
                    batch_id: batch_id.to_string(),
                    processed_rows: failure.processed_rows,
                    message: failure.message,
                })
            }
        }
    }

    fn execute(&self, batch_id: &str) -> Result<ReconciliationBatch, RunFailure> {
        let batch = self
            .recon_repo
            .find_batch(batch_id)
            .map_err(|e| RunFailure::new(0, e))?
            .ok_or_else(|| RunFailure::new(0, ReconcileError::BatchNotFound(batch_id.to_string())))?;

        // 快照只在此处装载一次
        let snapshot =
            ReferenceSnapshot::load(&self.reference_repo).map_err(|e| RunFailure::new(0, e))?;
        debug!(cards = snapshot.card_count(), "参考数据快照就绪");

        let records = self
            .recon_repo
            .load_external_records(batch_id)
            .map_err(|e| RunFailure::new(0, format!("外部记录读取失败: {}", e)))?;
        if records.len() as i64 != batch.total_rows {
            return Err(RunFailure::new(
                0,
                format!(
                    "外部记录数与批次不一致: stored={}, total_rows={}",
                    records.len(),
                    batch.total_rows
                ),
            ));
        }

        let outcomes = self
            .match_all(&records, &snapshot)
            .map_err(|e| RunFailure::new(0, e))?;

        let mut processed_rows = 0usize;
        for chunk in outcomes.chunks(PERSIST_CHUNK_ROWS) {
            self.recon_repo
                .upsert_outcomes(batch_id, chunk)
                .map_err(|e| RunFailure::new(processed_rows, e))?;
            processed_rows += chunk.len();
            debug!(batch_id = %batch_id, processed_rows, "匹配结果已落库");
        }

        let matched_rows = outcomes.iter().filter(|o| o.is_matched).count() as i64;
        let unmatched_rows = outcomes.len() as i64 - matched_rows;
        self.recon_repo
            .complete_batch(batch_id, matched_rows, unmatched_rows, Utc::now())
            .map_err(|e| RunFailure::new(processed_rows, e))?;

        self.recon_repo
            .find_batch(batch_id)
            .map_err(|e| RunFailure::new(processed_rows, e))?
            .ok_or_else(|| {
                RunFailure::new(
                    processed_rows,
                    ReconcileError::BatchNotFound(batch_id.to_string()),
                )
            })
    }

    /// 并行匹配,结果顺序与输入一致
    fn match_all(
        &self,
        records: &[ExternalRecord],
        snapshot: &ReferenceSnapshot,
    ) -> ReconcileResult<Vec<MatchOutcome>> {
        let workers = self.options.workers.max(1);
        if workers == 1 || records.len() < 2 {
            return records
                .iter()
                .map(|r| self.matcher.match_record(r, snapshot))
                .collect();
        }

        let chunk_size = (records.len() + workers - 1) / workers;
        let matcher = &self.matcher;
        let chunk_results: Vec<ReconcileResult<Vec<MatchOutcome>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = records
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|r| matcher.match_record(r, snapshot))
                            .collect::<ReconcileResult<Vec<_>>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(ReconcileError::Other(anyhow::anyhow!("匹配线程异常退出")))
                    })
                })
                .collect()
        });

        let mut outcomes = Vec::with_capacity(records.len());
        for result in chunk_results {
            outcomes.extend(result?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reference::{Card, Member, Redemption};
    use crate::domain::types::{BatchStatus, MatchReason};
    use chrono::{NaiveDate, NaiveDateTime};
    use rusqlite::Connection;
    use std::sync::Mutex;

    fn ymd(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    struct Fixture {
        conn: Arc<Mutex<Connection>>,
        recon: Arc<ReconciliationRepository>,
        reference: Arc<ReferenceRepository>,
    }

    fn fixture() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let recon = Arc::new(ReconciliationRepository::new(conn.clone()).unwrap());
        let reference = Arc::new(ReferenceRepository::new(conn.clone()).unwrap());

        reference
            .insert_member(&Member {
                member_id: "M1".to_string(),
                name: "Budi".to_string(),
                identity_number: "3174".to_string(),
            })
            .unwrap();
        reference
            .insert_card(&Card {
                card_id: "C1".to_string(),
                serial_number: "0125".to_string(),
                member_id: Some("M1".to_string()),
            })
            .unwrap();
        reference
            .insert_redemption(&Redemption {
                redeem_id: "R1".to_string(),
                card_id: "C1".to_string(),
                member_id: None,
                shift_date: ymd(14),
                station_name: None,
                redeem_type: None,
                created_at: NaiveDateTime::parse_from_str("2026-01-14 08:00:00", "%Y-%m-%d %H:%M:%S")
                    .unwrap(),
                seq: 0,
            })
            .unwrap();

        Fixture {
            conn,
            recon,
            reference,
        }
    }

    fn seed_batch(recon: &ReconciliationRepository, batch_id: &str, rows: usize) {
        let records: Vec<ExternalRecord> = (0..rows)
            .map(|i| ExternalRecord {
                row_number: i + 3,
                identity_number: if i % 2 == 0 { "3174".to_string() } else { "0000".to_string() },
                ticketing_date: ymd(14),
                raw_serial_code: String::new(),
                cleaned_serial_code: String::new(),
            })
            .collect();
        let batch = ReconciliationBatch::new_pending(
            batch_id.to_string(),
            "report.csv".to_string(),
            rows as i64,
            0,
            None,
        );
        recon.insert_batch_with_records(&batch, &records, &[]).unwrap();
    }

    #[test]
    fn test_run_matching_completes_with_consistent_counts() {
        let f = fixture();
        seed_batch(&f.recon, "B1", 7);
        let orchestrator = BatchOrchestrator::new(f.recon.clone(), f.reference.clone(), MatchingOptions { workers: 3 });

        let batch = orchestrator.run_matching("B1", Some("ops")).unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.matched_rows, 4);
        assert_eq!(batch.unmatched_rows, 3);
        assert!(batch.counts_consistent());
        assert_eq!(batch.matched_by.as_deref(), Some("ops"));

        let (outcomes, _) = f.recon.list_outcomes("B1", None, None, 0).unwrap();
        let rows: Vec<usize> = outcomes.iter().map(|o| o.external_record.row_number).collect();
        assert_eq!(rows, (3..10).collect::<Vec<_>>());
        assert_eq!(outcomes[0].reason(), Some(MatchReason::IdentityAndDateMatch));
        assert_eq!(outcomes[1].reason(), Some(MatchReason::IdentityNotFound));
    }

    #[test]
    fn test_second_run_rejected() {
        let f = fixture();
        seed_batch(&f.recon, "B1", 2);
        let orchestrator = BatchOrchestrator::new(f.recon.clone(), f.reference.clone(), MatchingOptions::default());

        orchestrator.run_matching("B1", None).unwrap();
        let err = orchestrator.run_matching("B1", None).unwrap_err();
        assert!(matches!(err, ReconcileError::BatchAlreadyMatched(_)));

        let err = orchestrator.run_matching("B404", None).unwrap_err();
        assert!(matches!(err, ReconcileError::BatchNotFound(_)));
    }

    #[test]
    fn test_corrupted_rows_fail_batch() {
        let f = fixture();
        seed_batch(&f.recon, "B1", 2);
        {
            let conn = f.conn.lock().unwrap();
            conn.execute(
                "UPDATE recon_external_record SET ticketing_date = 'garbage' WHERE row_number = 4",
                [],
            )
            .unwrap();
        }
        let orchestrator = BatchOrchestrator::new(f.recon.clone(), f.reference.clone(), MatchingOptions::default());

        let err = orchestrator.run_matching("B1", None).unwrap_err();
        assert!(matches!(err, ReconcileError::MatchingFailed { processed_rows: 0, .. }));

        let batch = f.recon.find_batch("B1").unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert!(batch.failure_reason.is_some());

        // FAILED 批次不可重跑
        let err = orchestrator.run_matching("B1", None).unwrap_err();
        assert!(matches!(err, ReconcileError::BatchFailed(_)));
    }

    #[test]
    fn test_snapshot_taken_at_matching_start() {
        let f = fixture();
        seed_batch(&f.recon, "B1", 1);
        let orchestrator = BatchOrchestrator::new(f.recon.clone(), f.reference.clone(), MatchingOptions { workers: 1 });

        let batch = orchestrator.run_matching("B1", None).unwrap();
        assert_eq!(batch.matched_rows, 1);

        // 之后的参考数据变更不影响已完成批次
        f.reference
            .soft_delete_redemption("R1", ymd(15).and_hms_opt(0, 0, 0).unwrap())
            .unwrap();
        let (outcomes, _) = f.recon.list_outcomes("B1", Some(true), None, 0).unwrap();
        assert_eq!(outcomes.len(), 1);
    }
}
