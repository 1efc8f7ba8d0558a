// ==========================================
// FWC 对账引擎 - 对账领域模型
// ==========================================
// 职责: 外部记录 / 对账批次 / 匹配结果 / 诊断信息 / 孤儿记录
// 所有权: 批次独占其外部记录与匹配结果（级联删除）
// ==========================================

use crate::domain::types::{BatchStatus, MatchReason, RowRejectReason};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// ExternalRecord - 外部报表行（规范化后）
// ==========================================
// 解析后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRecord {
    pub row_number: usize,          // 源文件行号（1 起）
    pub identity_number: String,    // 证件号（已 TRIM）
    pub ticketing_date: NaiveDate,  // 售票日期（忽略时刻）
    pub raw_serial_code: String,    // 原始卡号（可能为空）
    pub cleaned_serial_code: String, // 去除合作方前缀后的卡号
}

impl ExternalRecord {
    pub fn has_serial(&self) -> bool {
        !self.cleaned_serial_code.is_empty()
    }
}

// ==========================================
// ReconciliationBatch - 对账批次
// ==========================================
// 不变量: status == COMPLETED ⇒ matched_rows + unmatched_rows == total_rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationBatch {
    pub batch_id: String,
    pub source_file_name: String,
    pub total_rows: i64,
    pub matched_rows: i64,
    pub unmatched_rows: i64,
    pub rejected_rows: i64,
    pub status: BatchStatus,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub matched_by: Option<String>,
    pub matched_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl ReconciliationBatch {
    /// 新建 PENDING 批次
    pub fn new_pending(
        batch_id: String,
        source_file_name: String,
        total_rows: i64,
        rejected_rows: i64,
        created_by: Option<String>,
    ) -> Self {
        Self {
            batch_id,
            source_file_name,
            total_rows,
            matched_rows: 0,
            unmatched_rows: 0,
            rejected_rows,
            status: BatchStatus::Pending,
            created_by,
            created_at: Utc::now(),
            matched_by: None,
            matched_at: None,
            failure_reason: None,
        }
    }

    /// 计数不变量
    pub fn counts_consistent(&self) -> bool {
        self.status != BatchStatus::Completed
            || self.matched_rows + self.unmatched_rows == self.total_rows
    }
}

// ==========================================
// PartialInternalRecord - 部分命中诊断
// ==========================================
// 仅用于人工排查,不影响 is_matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialInternalRecord {
    pub member_id: Option<String>,
    pub member_name: Option<String>,
    pub member_nik: Option<String>,
    pub card_id: Option<String>,
    pub serial_number: Option<String>,
    pub redeem_id: Option<String>,
    pub redeem_date: Option<NaiveDate>,
    pub redeem_station: Option<String>,
}

// ==========================================
// MatchDetails - 匹配明细
// ==========================================
// 未命中层级的字段保留"已尝试但失败"的状态,不省略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDetails {
    pub serial_match: bool,
    pub nik_match: bool,
    pub date_match: bool,
    /// 是否尝试过卡号匹配（卡号为空时为 false）
    pub serial_attempted: bool,
    pub partial_fwc: Option<PartialInternalRecord>,
    pub reason: MatchReason,
}

// ==========================================
// MatchOutcome - 单行匹配结果
// ==========================================
// 不变量: is_matched ⇒ matched_card_id.is_some()
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOutcome {
    pub external_record: ExternalRecord,
    pub is_matched: bool,
    pub matched_card_id: Option<String>,
    pub matched_redeem_id: Option<String>,
    /// 匹配尚未执行时为 None
    pub match_details: Option<MatchDetails>,
}

impl MatchOutcome {
    /// 尚未匹配的占位结果（PENDING 批次的行）
    pub fn not_attempted(external_record: ExternalRecord) -> Self {
        Self {
            external_record,
            is_matched: false,
            matched_card_id: None,
            matched_redeem_id: None,
            match_details: None,
        }
    }

    pub fn reason(&self) -> Option<MatchReason> {
        self.match_details.as_ref().map(|d| d.reason)
    }
}

// ==========================================
// MatchedInternalRecord - 命中的内部记录
// ==========================================
// 批次明细中随匹配结果一起展示的卡/会员/核销信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedInternalRecord {
    pub card_id: String,
    pub serial_number: Option<String>,
    pub member_name: Option<String>,
    pub member_nik: Option<String>,
    pub redeem_id: Option<String>,
    pub redeem_date: Option<NaiveDate>,
    pub redeem_station: Option<String>,
    pub redeem_type: Option<String>,
}

// ==========================================
// OrphanInternalRecord - 孤儿核销
// ==========================================
// 批次日期范围内、报表中没有对应行的内部核销（仅提示,不计入批次统计）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanInternalRecord {
    pub card_id: String,
    pub serial_number: Option<String>,
    pub member_name: Option<String>,
    pub member_nik: Option<String>,
    pub redeem_id: String,
    pub redeem_date: NaiveDate,
    pub redeem_station: Option<String>,
    pub redeem_type: Option<String>,
}

// ==========================================
// 导入摘要
// ==========================================

/// 被拒绝的行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRejection {
    pub row_number: usize,
    pub reason: RowRejectReason,
    pub raw_value: Option<String>, // 触发拒绝的原始值（便于排查）
}

/// 导入摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub batch: ReconciliationBatch,
    pub rejections: Vec<RowRejection>,
    pub skipped_blank_rows: usize,
}

// ==========================================
// 分页
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: i64,
}

impl Pagination {
    pub fn new(total: i64, page: u32, limit: u32) -> Self {
        let limit_i = i64::from(limit.max(1));
        Self {
            total,
            page,
            limit,
            total_pages: (total + limit_i - 1) / limit_i,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_total_pages() {
        assert_eq!(Pagination::new(0, 1, 50).total_pages, 0);
        assert_eq!(Pagination::new(50, 1, 50).total_pages, 1);
        assert_eq!(Pagination::new(51, 2, 50).total_pages, 2);
    }

    #[test]
    fn test_counts_consistent_only_checked_when_completed() {
        let mut batch = ReconciliationBatch::new_pending(
            "B1".to_string(),
            "report.xlsx".to_string(),
            10,
            0,
            None,
        );
        assert!(batch.counts_consistent());

        batch.status = BatchStatus::Completed;
        batch.matched_rows = 4;
        batch.unmatched_rows = 5;
        assert!(!batch.counts_consistent());

        batch.unmatched_rows = 6;
        assert!(batch.counts_consistent());
    }

    #[test]
    fn test_match_details_wire_names() {
        let details = MatchDetails {
            serial_match: true,
            nik_match: false,
            date_match: false,
            serial_attempted: true,
            partial_fwc: None,
            reason: MatchReason::SerialMatchNoRedeemOnDate,
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["serialMatch"], true);
        assert_eq!(json["partialFwc"], serde_json::Value::Null);
        assert_eq!(json["reason"], "SERIAL_MATCH_NO_REDEEM_ON_DATE");
    }
}
