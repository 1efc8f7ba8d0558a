// ==========================================
// FWC 对账引擎 - 匹配器
// ==========================================
// 算法: 层级按序尝试,首个命中即返回（不打分,不取最优）
//   第 1 层: 合作方卡号 → 卡（命中即视为匹配）
//   第 2 层: 证件号 + 售票日期 → 会员当日核销
// 约束: 纯函数,不写库; 同一输入同一快照必得同一结果
// ==========================================

use crate::domain::reconciliation::{
    ExternalRecord, MatchDetails, MatchOutcome, PartialInternalRecord,
};
use crate::domain::types::MatchReason;
use crate::engine::error::ReconcileResult;
use crate::engine::reference_index::ReferenceIndex;

/// 某一层的命中结果
#[derive(Debug, Clone, PartialEq)]
pub struct TierHit {
    pub card_id: String,
    pub redeem_id: Option<String>,
}

// ==========================================
// MatchStrategy Trait - 匹配层
// ==========================================
// 每层在共享的 MatchDetails 上记录尝试结果; 未命中的层保留失败状态
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 尝试匹配
    ///
    /// # 返回
    /// - Ok(Some(hit)): 本层命中,后续层不再执行
    /// - Ok(None): 本层未命中
    fn try_match(
        &self,
        record: &ExternalRecord,
        index: &dyn ReferenceIndex,
        details: &mut MatchDetails,
    ) -> ReconcileResult<Option<TierHit>>;
}

// ==========================================
// 第 1 层: 卡号匹配
// ==========================================
pub struct SerialTier;

impl MatchStrategy for SerialTier {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn try_match(
        &self,
        record: &ExternalRecord,
        index: &dyn ReferenceIndex,
        details: &mut MatchDetails,
    ) -> ReconcileResult<Option<TierHit>> {
        if !record.has_serial() {
            return Ok(None);
        }
        details.serial_attempted = true;

        let card = match index.find_card_by_serial(&record.cleaned_serial_code)? {
            Some(card) => card,
            None => {
                details.serial_match = false;
                return Ok(None);
            }
        };
        details.serial_match = true;

        // 证件号交叉核对: 报表证件号对应的会员是否就是持卡会员（仅诊断）
        if let Some(member_id) = card.member_id.as_deref() {
            details.nik_match = index
                .find_member_by_identity(&record.identity_number)?
                .map(|m| m.member_id == member_id)
                .unwrap_or(false);
        }

        let redemption = match card.member_id.as_deref() {
            Some(member_id) => index.find_redemption(member_id, record.ticketing_date)?,
            None => None,
        };

        match redemption {
            Some(r) => {
                details.date_match = true;
                details.reason = MatchReason::SerialAndDateMatch;
                Ok(Some(TierHit {
                    card_id: card.card_id,
                    redeem_id: Some(r.redeem_id),
                }))
            }
            None => {
                details.date_match = false;
                details.reason = MatchReason::SerialMatchNoRedeemOnDate;
                Ok(Some(TierHit {
                    card_id: card.card_id,
                    redeem_id: None,
                }))
            }
        }
    }
}

// ==========================================
// 第 2 层: 证件号 + 日期
// ==========================================
pub struct IdentityDateTier;

impl MatchStrategy for IdentityDateTier {
    fn name(&self) -> &'static str {
        "identity_date"
    }

    fn try_match(
        &self,
        record: &ExternalRecord,
        index: &dyn ReferenceIndex,
        details: &mut MatchDetails,
    ) -> ReconcileResult<Option<TierHit>> {
        let member = match index.find_member_by_identity(&record.identity_number)? {
            Some(member) => member,
            None => {
                details.nik_match = false;
                details.reason = MatchReason::IdentityNotFound;
                return Ok(None);
            }
        };
        details.nik_match = true;

        if let Some(r) = index.find_redemption(&member.member_id, record.ticketing_date)? {
            details.date_match = true;
            details.reason = MatchReason::IdentityAndDateMatch;
            return Ok(Some(TierHit {
                card_id: r.card_id,
                redeem_id: Some(r.redeem_id),
            }));
        }

        details.date_match = false;
        details.reason = MatchReason::IdentityFoundNoRedeemOnDate;

        // 附上会员最近一次核销,便于人工排查
        let latest = index.find_latest_redemption(&member.member_id)?;
        let latest_card = match latest.as_ref() {
            Some(r) => index.find_card_by_id(&r.card_id)?,
            None => None,
        };
        details.partial_fwc = Some(PartialInternalRecord {
            member_id: Some(member.member_id),
            member_name: Some(member.name),
            member_nik: Some(member.identity_number),
            card_id: latest.as_ref().map(|r| r.card_id.clone()),
            serial_number: latest_card.map(|c| c.serial_number),
            redeem_id: latest.as_ref().map(|r| r.redeem_id.clone()),
            redeem_date: latest.as_ref().map(|r| r.shift_date),
            redeem_station: latest.and_then(|r| r.station_name),
        });
        Ok(None)
    }
}

// ==========================================
// Matcher - 匹配器
// ==========================================
pub struct Matcher {
    tiers: Vec<Box<dyn MatchStrategy>>,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(vec![Box::new(SerialTier), Box::new(IdentityDateTier)])
    }
}

impl Matcher {
    pub fn new(tiers: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self { tiers }
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// 匹配一条外部记录
    ///
    /// # 返回
    /// - Ok(MatchOutcome): match_details 总是存在
    /// - Err: 参考数据读取失败（快照模式下不会发生）
    pub fn match_record(
        &self,
        record: &ExternalRecord,
        index: &dyn ReferenceIndex,
    ) -> ReconcileResult<MatchOutcome> {
        let mut details = MatchDetails {
            serial_match: false,
            nik_match: false,
            date_match: false,
            serial_attempted: false,
            partial_fwc: None,
            reason: MatchReason::IdentityNotFound,
        };

        for tier in &self.tiers {
            if let Some(hit) = tier.try_match(record, index, &mut details)? {
                return Ok(MatchOutcome {
                    external_record: record.clone(),
                    is_matched: true,
                    matched_card_id: Some(hit.card_id),
                    matched_redeem_id: hit.redeem_id,
                    match_details: Some(details),
                });
            }
        }

        Ok(MatchOutcome {
            external_record: record.clone(),
            is_matched: false,
            matched_card_id: None,
            matched_redeem_id: None,
            match_details: Some(details),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::reference::{Card, Member, Redemption};
    use crate::engine::reference_index::ReferenceSnapshot;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ymd(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn redemption(id: &str, card_id: &str, day: u32, seq: i64) -> Redemption {
        Redemption {
            redeem_id: id.to_string(),
            card_id: card_id.to_string(),
            member_id: None,
            shift_date: ymd(day),
            station_name: Some("Halim".to_string()),
            redeem_type: Some("SINGLE".to_string()),
            created_at: NaiveDateTime::parse_from_str(
                &format!("2026-01-{:02} 08:00:00", day),
                "%Y-%m-%d %H:%M:%S",
            )
            .unwrap(),
            seq,
        }
    }

    /// 会员 M1 (NIK 3174) 持卡 C1 (0125), 1/14 有核销 R1
    /// 会员 M2 (NIK 5555) 持卡 C2 (0999), 1/10 有核销 R2
    /// 库存卡 C3 (0777) 未绑定会员
    fn snapshot() -> ReferenceSnapshot {
        let cards = vec![
            Card {
                card_id: "C1".to_string(),
                serial_number: "01252600033".to_string(),
                member_id: Some("M1".to_string()),
            },
            Card {
                card_id: "C2".to_string(),
                serial_number: "0999".to_string(),
                member_id: Some("M2".to_string()),
            },
            Card {
                card_id: "C3".to_string(),
                serial_number: "0777".to_string(),
                member_id: None,
            },
        ];
        let members = vec![
            Member {
                member_id: "M1".to_string(),
                name: "Budi".to_string(),
                identity_number: "3174".to_string(),
            },
            Member {
                member_id: "M2".to_string(),
                name: "Sari".to_string(),
                identity_number: "5555".to_string(),
            },
        ];
        let redemptions = vec![redemption("R1", "C1", 14, 1), redemption("R2", "C2", 10, 2)];
        ReferenceSnapshot::build(cards, members, redemptions)
    }

    fn record(identity: &str, day: u32, raw_serial: &str) -> ExternalRecord {
        ExternalRecord {
            row_number: 3,
            identity_number: identity.to_string(),
            ticketing_date: ymd(day),
            raw_serial_code: raw_serial.to_string(),
            cleaned_serial_code: raw_serial.strip_prefix("FWC-").unwrap_or(raw_serial).to_string(),
        }
    }

    fn details(outcome: &MatchOutcome) -> &MatchDetails {
        outcome.match_details.as_ref().unwrap()
    }

    #[test]
    fn test_serial_and_date_match() {
        let snap = snapshot();
        let outcome = Matcher::default()
            .match_record(&record("3174", 14, "FWC-01252600033"), &snap)
            .unwrap();

        assert!(outcome.is_matched);
        assert_eq!(outcome.matched_card_id.as_deref(), Some("C1"));
        assert_eq!(outcome.matched_redeem_id.as_deref(), Some("R1"));
        let d = details(&outcome);
        assert!(d.serial_match && d.date_match && d.nik_match && d.serial_attempted);
        assert_eq!(d.reason, MatchReason::SerialAndDateMatch);
    }

    #[test]
    fn test_serial_match_without_redeem_still_matched() {
        let snap = snapshot();
        let outcome = Matcher::default()
            .match_record(&record("3174", 20, "01252600033"), &snap)
            .unwrap();

        assert!(outcome.is_matched);
        assert_eq!(outcome.matched_card_id.as_deref(), Some("C1"));
        assert!(outcome.matched_redeem_id.is_none());
        let d = details(&outcome);
        assert!(d.serial_match);
        assert!(!d.date_match);
        assert_eq!(d.reason, MatchReason::SerialMatchNoRedeemOnDate);
    }

    #[test]
    fn test_serial_match_with_other_identity_flags_nik_mismatch() {
        let snap = snapshot();
        let outcome = Matcher::default()
            .match_record(&record("5555", 14, "FWC-01252600033"), &snap)
            .unwrap();

        assert!(outcome.is_matched);
        assert!(!details(&outcome).nik_match);
    }

    #[test]
    fn test_serial_match_on_unassigned_card() {
        let snap = snapshot();
        let outcome = Matcher::default()
            .match_record(&record("9999", 14, "0777"), &snap)
            .unwrap();

        assert!(outcome.is_matched);
        assert_eq!(outcome.matched_card_id.as_deref(), Some("C3"));
        assert_eq!(details(&outcome).reason, MatchReason::SerialMatchNoRedeemOnDate);
    }

    #[test]
    fn test_identity_fallback_when_serial_empty() {
        let snap = snapshot();
        let outcome = Matcher::default()
            .match_record(&record("3174", 14, ""), &snap)
            .unwrap();

        assert!(outcome.is_matched);
        assert_eq!(outcome.matched_card_id.as_deref(), Some("C1"));
        assert_eq!(outcome.matched_redeem_id.as_deref(), Some("R1"));
        let d = details(&outcome);
        assert!(!d.serial_attempted && !d.serial_match);
        assert!(d.nik_match && d.date_match);
        assert_eq!(d.reason, MatchReason::IdentityAndDateMatch);
    }

    #[test]
    fn test_identity_fallback_after_unknown_serial() {
        let snap = snapshot();
        let outcome = Matcher::default()
            .match_record(&record("3174", 14, "FWC-00000000000"), &snap)
            .unwrap();

        assert!(outcome.is_matched);
        let d = details(&outcome);
        assert!(d.serial_attempted);
        assert!(!d.serial_match);
        assert_eq!(d.reason, MatchReason::IdentityAndDateMatch);
    }

    #[test]
    fn test_identity_found_no_redeem_carries_partial() {
        let snap = snapshot();
        let outcome = Matcher::default()
            .match_record(&record("5555", 14, ""), &snap)
            .unwrap();

        assert!(!outcome.is_matched);
        assert!(outcome.matched_card_id.is_none());
        let d = details(&outcome);
        assert!(d.nik_match);
        assert!(!d.date_match);
        assert_eq!(d.reason, MatchReason::IdentityFoundNoRedeemOnDate);

        let partial = d.partial_fwc.as_ref().unwrap();
        assert_eq!(partial.member_name.as_deref(), Some("Sari"));
        assert_eq!(partial.redeem_id.as_deref(), Some("R2"));
        assert_eq!(partial.serial_number.as_deref(), Some("0999"));
        assert_eq!(partial.redeem_date, Some(ymd(10)));
    }

    #[test]
    fn test_identity_not_found() {
        let snap = snapshot();
        for serial in ["", "FWC-404"] {
            let outcome = Matcher::default()
                .match_record(&record("0000", 14, serial), &snap)
                .unwrap();
            assert!(!outcome.is_matched);
            let d = details(&outcome);
            assert!(!d.serial_match && !d.nik_match && !d.date_match);
            assert_eq!(d.reason, MatchReason::IdentityNotFound);
        }
    }

    #[test]
    fn test_match_is_deterministic() {
        let snap = snapshot();
        let matcher = Matcher::default();
        let r = record("3174", 14, "FWC-01252600033");
        assert_eq!(
            matcher.match_record(&r, &snap).unwrap(),
            matcher.match_record(&r, &snap).unwrap()
        );
        assert_eq!(matcher.tier_names(), vec!["serial", "identity_date"]);
    }
}
