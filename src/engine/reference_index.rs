// ==========================================
// FWC 对账引擎 - 参考数据索引
// ==========================================
// 职责: 为匹配器提供只读查找
// 纪律: 匹配运行在 MATCHING 开始时装载的一次性快照上,
//       同一批次的所有行看到同一份卡/会员/核销数据
// 孤儿扫描: 查询时读实时库（ReferenceRepository 实现同一接口）
// ==========================================

use crate::domain::reference::{Card, Member, Redemption, RedemptionView};
use crate::engine::error::{ReconcileError, ReconcileResult};
use crate::repository::ReferenceRepository;
use chrono::NaiveDate;
use std::collections::HashMap;
use tracing::debug;

// ==========================================
// ReferenceIndex Trait
// ==========================================
pub trait ReferenceIndex: Send + Sync {
    /// 卡号精确匹配（卡号已无合作方前缀）
    fn find_card_by_serial(&self, serial: &str) -> ReconcileResult<Option<Card>>;

    fn find_card_by_id(&self, card_id: &str) -> ReconcileResult<Option<Card>>;

    /// 证件号精确匹配
    fn find_member_by_identity(&self, identity_number: &str) -> ReconcileResult<Option<Member>>;

    /// 会员在指定班次日期的核销; 多条时取最新创建,再按插入顺序
    fn find_redemption(&self, member_id: &str, date: NaiveDate) -> ReconcileResult<Option<Redemption>>;

    /// 会员最近一次核销（诊断用）
    fn find_latest_redemption(&self, member_id: &str) -> ReconcileResult<Option<Redemption>>;

    /// 日期范围内全部核销（含首尾,班次日期升序）
    fn find_redemptions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ReconcileResult<Vec<RedemptionView>>;
}

fn lookup_err(e: crate::repository::RepositoryError) -> ReconcileError {
    ReconcileError::ReferenceLookup(e.to_string())
}

impl ReferenceIndex for ReferenceRepository {
    fn find_card_by_serial(&self, serial: &str) -> ReconcileResult<Option<Card>> {
        ReferenceRepository::find_card_by_serial(self, serial).map_err(lookup_err)
    }

    fn find_card_by_id(&self, card_id: &str) -> ReconcileResult<Option<Card>> {
        ReferenceRepository::find_card_by_id(self, card_id).map_err(lookup_err)
    }

    fn find_member_by_identity(&self, identity_number: &str) -> ReconcileResult<Option<Member>> {
        ReferenceRepository::find_member_by_identity(self, identity_number).map_err(lookup_err)
    }

    fn find_redemption(&self, member_id: &str, date: NaiveDate) -> ReconcileResult<Option<Redemption>> {
        ReferenceRepository::find_redemption(self, member_id, date).map_err(lookup_err)
    }

    fn find_latest_redemption(&self, member_id: &str) -> ReconcileResult<Option<Redemption>> {
        ReferenceRepository::find_latest_redemption(self, member_id).map_err(lookup_err)
    }

    fn find_redemptions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ReconcileResult<Vec<RedemptionView>> {
        ReferenceRepository::find_redemptions_in_range(self, start, end).map_err(lookup_err)
    }
}

// ==========================================
// ReferenceSnapshot - 内存快照
// ==========================================
#[derive(Debug, Default, Clone)]
pub struct ReferenceSnapshot {
    cards_by_serial: HashMap<String, Card>,
    cards_by_id: HashMap<String, Card>,
    members_by_identity: HashMap<String, Member>,
    members_by_id: HashMap<String, Member>,
    // (member_id, shift_date) → 最新核销
    redemptions_by_member_date: HashMap<(String, NaiveDate), Redemption>,
    latest_by_member: HashMap<String, Redemption>,
    // 按 (shift_date, created_at, seq) 升序
    redemptions: Vec<Redemption>,
}

impl ReferenceSnapshot {
    /// 从参考数据仓储装载快照
    pub fn load(repo: &ReferenceRepository) -> ReconcileResult<Self> {
        let cards = repo.load_all_cards().map_err(lookup_err)?;
        let members = repo.load_all_members().map_err(lookup_err)?;
        let redemptions = repo.load_all_redemptions().map_err(lookup_err)?;

        let snapshot = Self::build(cards, members, redemptions);
        debug!(
            cards = snapshot.cards_by_id.len(),
            members = snapshot.members_by_id.len(),
            redemptions = snapshot.redemptions.len(),
            "参考数据快照装载完成"
        );
        Ok(snapshot)
    }

    /// 由内存数据构建（输入按录入顺序）
    ///
    /// 卡号/证件号重复时保留最早录入的一条,与仓储查询一致
    pub fn build(cards: Vec<Card>, members: Vec<Member>, redemptions: Vec<Redemption>) -> Self {
        let mut snapshot = Self::default();

        for card in cards {
            snapshot
                .cards_by_serial
                .entry(card.serial_number.clone())
                .or_insert_with(|| card.clone());
            snapshot.cards_by_id.insert(card.card_id.clone(), card);
        }

        for member in members {
            snapshot
                .members_by_identity
                .entry(member.identity_number.clone())
                .or_insert_with(|| member.clone());
            snapshot.members_by_id.insert(member.member_id.clone(), member);
        }

        for mut redemption in redemptions {
            // member_id 以快照内卡的归属为准
            redemption.member_id = snapshot
                .cards_by_id
                .get(&redemption.card_id)
                .and_then(|c| c.member_id.clone());

            if let Some(member_id) = redemption.member_id.clone() {
                let key = (member_id.clone(), redemption.shift_date);
                keep_latest(snapshot.redemptions_by_member_date.entry(key), &redemption);
                keep_latest(snapshot.latest_by_member.entry(member_id), &redemption);
            }
            snapshot.redemptions.push(redemption);
        }

        snapshot
            .redemptions
            .sort_by(|a, b| (a.shift_date, a.recency_key()).cmp(&(b.shift_date, b.recency_key())));
        snapshot
    }

    pub fn card_count(&self) -> usize {
        self.cards_by_id.len()
    }
}

fn keep_latest<K>(entry: std::collections::hash_map::Entry<'_, K, Redemption>, candidate: &Redemption) {
    use std::collections::hash_map::Entry;
    match entry {
        Entry::Occupied(mut slot) => {
            if candidate.recency_key() > slot.get().recency_key() {
                slot.insert(candidate.clone());
            }
        }
        Entry::Vacant(slot) => {
            slot.insert(candidate.clone());
        }
    }
}

impl ReferenceIndex for ReferenceSnapshot {
    fn find_card_by_serial(&self, serial: &str) -> ReconcileResult<Option<Card>> {
        Ok(self.cards_by_serial.get(serial).cloned())
    }

    fn find_card_by_id(&self, card_id: &str) -> ReconcileResult<Option<Card>> {
        Ok(self.cards_by_id.get(card_id).cloned())
    }

    fn find_member_by_identity(&self, identity_number: &str) -> ReconcileResult<Option<Member>> {
        Ok(self.members_by_identity.get(identity_number).cloned())
    }

    fn find_redemption(&self, member_id: &str, date: NaiveDate) -> ReconcileResult<Option<Redemption>> {
        Ok(self
            .redemptions_by_member_date
            .get(&(member_id.to_string(), date))
            .cloned())
    }

    fn find_latest_redemption(&self, member_id: &str) -> ReconcileResult<Option<Redemption>> {
        Ok(self.latest_by_member.get(member_id).cloned())
    }

    fn find_redemptions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> ReconcileResult<Vec<RedemptionView>> {
        let views = self
            .redemptions
            .iter()
            .filter(|r| r.shift_date >= start && r.shift_date <= end)
            .map(|r| {
                let card = self.cards_by_id.get(&r.card_id);
                let member = r.member_id.as_ref().and_then(|id| self.members_by_id.get(id));
                RedemptionView {
                    redemption: r.clone(),
                    serial_number: card.map(|c| c.serial_number.clone()),
                    member_name: member.map(|m| m.name.clone()),
                    member_nik: member.map(|m| m.identity_number.clone()),
                }
            })
            .collect();
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn ymd(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn redemption(id: &str, card_id: &str, day: u32, created_at: &str, seq: i64) -> Redemption {
        Redemption {
            redeem_id: id.to_string(),
            card_id: card_id.to_string(),
            member_id: None,
            shift_date: ymd(day),
            station_name: None,
            redeem_type: None,
            created_at: NaiveDateTime::parse_from_str(created_at, "%Y-%m-%d %H:%M:%S").unwrap(),
            seq,
        }
    }

    fn snapshot() -> ReferenceSnapshot {
        let cards = vec![
            Card {
                card_id: "C1".to_string(),
                serial_number: "0125".to_string(),
                member_id: Some("M1".to_string()),
            },
            Card {
                card_id: "C2".to_string(),
                serial_number: "0125".to_string(),
                member_id: None,
            },
        ];
        let members = vec![Member {
            member_id: "M1".to_string(),
            name: "Budi".to_string(),
            identity_number: "3174".to_string(),
        }];
        let redemptions = vec![
            redemption("R1", "C1", 14, "2026-01-14 08:00:00", 1),
            redemption("R2", "C1", 14, "2026-01-14 09:00:00", 2),
            redemption("R3", "C1", 14, "2026-01-14 09:00:00", 3),
            redemption("R4", "C1", 10, "2026-01-20 07:00:00", 4),
            redemption("R5", "C2", 12, "2026-01-12 07:00:00", 5),
        ];
        ReferenceSnapshot::build(cards, members, redemptions)
    }

    #[test]
    fn test_duplicate_serial_keeps_first_card() {
        let snap = snapshot();
        assert_eq!(snap.find_card_by_serial("0125").unwrap().unwrap().card_id, "C1");
        assert!(snap.find_card_by_serial("FWC-0125").unwrap().is_none());
        assert_eq!(snap.card_count(), 2);
    }

    #[test]
    fn test_find_redemption_tie_broken_by_insertion_order() {
        let snap = snapshot();
        let found = snap.find_redemption("M1", ymd(14)).unwrap().unwrap();
        assert_eq!(found.redeem_id, "R3");
        assert_eq!(found.member_id.as_deref(), Some("M1"));
    }

    #[test]
    fn test_latest_redemption_by_created_at() {
        let snap = snapshot();
        // R4 班次日期更早但创建时间最新
        assert_eq!(snap.find_latest_redemption("M1").unwrap().unwrap().redeem_id, "R4");
        assert!(snap.find_latest_redemption("M404").unwrap().is_none());
    }

    #[test]
    fn test_redemptions_in_range() {
        let snap = snapshot();
        let views = snap.find_redemptions_in_range(ymd(11), ymd(13)).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].redemption.redeem_id, "R5");
        assert_eq!(views[0].serial_number.as_deref(), Some("0125"));
        assert!(views[0].member_nik.is_none());

        let ids: Vec<String> = snap
            .find_redemptions_in_range(ymd(1), ymd(31))
            .unwrap()
            .into_iter()
            .map(|v| v.redemption.redeem_id)
            .collect();
        assert_eq!(ids, vec!["R4", "R5", "R1", "R2", "R3"]);
    }
}
