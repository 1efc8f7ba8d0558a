// ==========================================
// FWC 对账引擎 - 参考数据实体
// ==========================================
// 职责: 卡 / 会员 / 核销记录（由外部模块维护,本引擎只读）
// ==========================================

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// 会员卡
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub card_id: String,
    pub serial_number: String,     // 已规范化（无合作方前缀）
    pub member_id: Option<String>, // 未绑定会员的库存卡为 None
}

/// 会员
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub name: String,
    pub identity_number: String, // NIK / 护照号
}

/// 核销记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    pub redeem_id: String,
    pub card_id: String,
    pub member_id: Option<String>, // 经由卡关联得到
    pub shift_date: NaiveDate,     // 班次日期（无时刻）
    pub station_name: Option<String>,
    pub redeem_type: Option<String>,
    pub created_at: NaiveDateTime,
    /// 插入顺序（SQLite rowid）,用于 created_at 相同时的决胜
    pub seq: i64,
}

impl Redemption {
    /// "更新"的排序键: created_at 优先,其次插入顺序
    pub fn recency_key(&self) -> (NaiveDateTime, i64) {
        (self.created_at, self.seq)
    }
}

/// 带卡号与会员信息的核销记录（孤儿扫描使用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionView {
    pub redemption: Redemption,
    pub serial_number: Option<String>,
    pub member_name: Option<String>,
    pub member_nik: Option<String>,
}
