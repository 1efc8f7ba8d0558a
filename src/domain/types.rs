// ==========================================
// FWC 对账引擎 - 领域类型定义
// ==========================================
// 职责: 批次状态机 / 匹配原因码 / 行拒绝原因 / 单元格变体
// 序列化格式: SCREAMING_SNAKE_CASE (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 批次状态 (Batch Status)
// ==========================================
// 状态机: PENDING → MATCHING → {COMPLETED | FAILED}
// 终态不可迁出; FAILED 批次只能删除后重新导入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,  // 已导入,待匹配
    Matching, // 匹配中
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Matching => "MATCHING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    /// 解析数据库/接口中的状态字符串（大小写不敏感）
    pub fn parse(s: &str) -> Option<BatchStatus> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Some(BatchStatus::Pending),
            "MATCHING" => Some(BatchStatus::Matching),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// 状态迁移是否合法
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Pending, BatchStatus::Matching)
                | (BatchStatus::Matching, BatchStatus::Completed)
                | (BatchStatus::Matching, BatchStatus::Failed)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 匹配原因码 (Match Reason)
// ==========================================
// 封闭集合,逐行落库,不作为错误抛出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchReason {
    SerialAndDateMatch,           // 卡号命中 + 当日核销
    SerialMatchNoRedeemOnDate,    // 卡号命中,当日无核销（仍计为匹配）
    IdentityAndDateMatch,         // 证件号 + 日期命中
    IdentityFoundNoRedeemOnDate,  // 证件号存在,当日无核销
    IdentityNotFound,             // 证件号不存在
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::SerialAndDateMatch => "SERIAL_AND_DATE_MATCH",
            MatchReason::SerialMatchNoRedeemOnDate => "SERIAL_MATCH_NO_REDEEM_ON_DATE",
            MatchReason::IdentityAndDateMatch => "IDENTITY_AND_DATE_MATCH",
            MatchReason::IdentityFoundNoRedeemOnDate => "IDENTITY_FOUND_NO_REDEEM_ON_DATE",
            MatchReason::IdentityNotFound => "IDENTITY_NOT_FOUND",
        }
    }

    /// 该原因码是否代表"已匹配"
    pub fn is_match(&self) -> bool {
        matches!(
            self,
            MatchReason::SerialAndDateMatch
                | MatchReason::SerialMatchNoRedeemOnDate
                | MatchReason::IdentityAndDateMatch
        )
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 行拒绝原因 (Row Reject Reason)
// ==========================================
// 行级、非致命: 被拒绝的行不计入 total_rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowRejectReason {
    MissingIdentity,
    InvalidDate,
}

impl RowRejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowRejectReason::MissingIdentity => "MISSING_IDENTITY",
            RowRejectReason::InvalidDate => "INVALID_DATE",
        }
    }
}

impl fmt::Display for RowRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 单元格值 (Cell Value)
// ==========================================
// 报表读取器输出的动态单元格,在行规范化阶段显式转换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

impl CellValue {
    /// 空单元格或纯空白文本
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(_) => false,
        }
    }

    /// 转为去首尾空白的字符串
    ///
    /// 整数值数字不带小数部分输出（证件号/卡号常被表格存成数字）
    pub fn to_trimmed_string(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e17 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(s.to_string())
        }
    }
}
