// ==========================================
// FWC 对账引擎 - 参考数据仓储
// ==========================================
// 表: members / cards / card_redeem（由会员与核销模块维护）
// 红线: 对账引擎只读; 写入方法仅供数据同步与测试装载
// 约定: deleted_at 非空的核销记录对所有查询不可见
// ==========================================

use crate::domain::reconciliation::MatchedInternalRecord;
use crate::domain::reference::{Card, Member, Redemption, RedemptionView};
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::sync::{Arc, Mutex};

const REDEMPTION_COLUMNS: &str = r#"
    r.redeem_id, r.card_id, c.member_id, r.shift_date,
    r.station_name, r.redeem_type, r.created_at, r.rowid
"#;

// ==========================================
// ReferenceRepository - 参考数据仓储
// ==========================================
pub struct ReferenceRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ReferenceRepository {
    /// 从已有连接创建仓储实例（表不存在时自动建表）
    pub fn new(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let repo = Self { conn };
        repo.ensure_tables()?;
        Ok(repo)
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn ensure_tables(&self) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS members (
              member_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              identity_number TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cards (
              card_id TEXT PRIMARY KEY,
              serial_number TEXT NOT NULL,
              member_id TEXT REFERENCES members(member_id)
            );

            CREATE TABLE IF NOT EXISTS card_redeem (
              redeem_id TEXT PRIMARY KEY,
              card_id TEXT NOT NULL REFERENCES cards(card_id),
              shift_date TEXT NOT NULL,
              station_name TEXT,
              redeem_type TEXT,
              created_at TEXT NOT NULL,
              deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_members_identity ON members(identity_number);
            CREATE INDEX IF NOT EXISTS idx_cards_serial ON cards(serial_number);
            CREATE INDEX IF NOT EXISTS idx_cards_member ON cards(member_id);
            CREATE INDEX IF NOT EXISTS idx_card_redeem_card_date ON card_redeem(card_id, shift_date);
            CREATE INDEX IF NOT EXISTS idx_card_redeem_shift_date ON card_redeem(shift_date);
            "#,
        )?;
        Ok(())
    }

    // ==========================================
    // 行映射
    // ==========================================

    fn map_card(row: &Row) -> SqliteResult<Card> {
        Ok(Card {
            card_id: row.get(0)?,
            serial_number: row.get(1)?,
            member_id: row.get(2)?,
        })
    }

    fn map_member(row: &Row) -> SqliteResult<Member> {
        Ok(Member {
            member_id: row.get(0)?,
            name: row.get(1)?,
            identity_number: row.get(2)?,
        })
    }

    /// 与 REDEMPTION_COLUMNS 顺序一致
    fn map_redemption(row: &Row) -> SqliteResult<Redemption> {
        Ok(Redemption {
            redeem_id: row.get(0)?,
            card_id: row.get(1)?,
            member_id: row.get(2)?,
            shift_date: row.get::<_, NaiveDate>(3)?,
            station_name: row.get(4)?,
            redeem_type: row.get(5)?,
            created_at: row.get::<_, NaiveDateTime>(6)?,
            seq: row.get(7)?,
        })
    }

    // ==========================================
    // 写入（数据同步 / 测试装载）
    // ==========================================

    pub fn insert_member(&self, member: &Member) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO members (member_id, name, identity_number) VALUES (?1, ?2, ?3)",
            params![member.member_id, member.name, member.identity_number],
        )?;
        Ok(())
    }

    pub fn insert_card(&self, card: &Card) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO cards (card_id, serial_number, member_id) VALUES (?1, ?2, ?3)",
            params![card.card_id, card.serial_number, card.member_id],
        )?;
        Ok(())
    }

    /// 插入核销记录（member_id 与 seq 由卡关联和 rowid 决定,忽略传入值）
    pub fn insert_redemption(&self, redemption: &Redemption) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO card_redeem (redeem_id, card_id, shift_date, station_name, redeem_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                redemption.redeem_id,
                redemption.card_id,
                redemption.shift_date,
                redemption.station_name,
                redemption.redeem_type,
                redemption.created_at,
            ],
        )?;
        Ok(())
    }

    /// 软删除核销记录
    pub fn soft_delete_redemption(
        &self,
        redeem_id: &str,
        deleted_at: NaiveDateTime,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE card_redeem SET deleted_at = ?2 WHERE redeem_id = ?1 AND deleted_at IS NULL",
            params![redeem_id, deleted_at],
        )?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                entity: "Redemption".to_string(),
                id: redeem_id.to_string(),
            });
        }
        Ok(())
    }

    // ==========================================
    // 单条查询
    // ==========================================

    /// 按卡号精确查找（卡号重复时取最早录入的一张）
    pub fn find_card_by_serial(&self, serial: &str) -> RepositoryResult<Option<Card>> {
        let conn = self.get_conn()?;
        let card = conn
            .query_row(
                r#"
                SELECT card_id, serial_number, member_id FROM cards
                WHERE serial_number = ?1
                ORDER BY rowid ASC LIMIT 1
                "#,
                params![serial],
                Self::map_card,
            )
            .optional()?;
        Ok(card)
    }

    pub fn find_card_by_id(&self, card_id: &str) -> RepositoryResult<Option<Card>> {
        let conn = self.get_conn()?;
        let card = conn
            .query_row(
                "SELECT card_id, serial_number, member_id FROM cards WHERE card_id = ?1",
                params![card_id],
                Self::map_card,
            )
            .optional()?;
        Ok(card)
    }

    /// 按证件号精确查找会员
    pub fn find_member_by_identity(&self, identity_number: &str) -> RepositoryResult<Option<Member>> {
        let conn = self.get_conn()?;
        let member = conn
            .query_row(
                r#"
                SELECT member_id, name, identity_number FROM members
                WHERE identity_number = ?1
                ORDER BY rowid ASC LIMIT 1
                "#,
                params![identity_number],
                Self::map_member,
            )
            .optional()?;
        Ok(member)
    }

    pub fn find_member_by_id(&self, member_id: &str) -> RepositoryResult<Option<Member>> {
        let conn = self.get_conn()?;
        let member = conn
            .query_row(
                "SELECT member_id, name, identity_number FROM members WHERE member_id = ?1",
                params![member_id],
                Self::map_member,
            )
            .optional()?;
        Ok(member)
    }

    /// 会员在指定班次日期的核销（多条时取最新创建,再按插入顺序）
    pub fn find_redemption(
        &self,
        member_id: &str,
        shift_date: NaiveDate,
    ) -> RepositoryResult<Option<Redemption>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {REDEMPTION_COLUMNS}
            FROM card_redeem r JOIN cards c ON c.card_id = r.card_id
            WHERE c.member_id = ?1 AND r.shift_date = ?2 AND r.deleted_at IS NULL
            ORDER BY r.created_at DESC, r.rowid DESC
            LIMIT 1
            "#
        );
        let redemption = conn
            .query_row(&sql, params![member_id, shift_date], Self::map_redemption)
            .optional()?;
        Ok(redemption)
    }

    /// 会员最近一次核销（不限日期）
    pub fn find_latest_redemption(&self, member_id: &str) -> RepositoryResult<Option<Redemption>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {REDEMPTION_COLUMNS}
            FROM card_redeem r JOIN cards c ON c.card_id = r.card_id
            WHERE c.member_id = ?1 AND r.deleted_at IS NULL
            ORDER BY r.created_at DESC, r.rowid DESC
            LIMIT 1
            "#
        );
        let redemption = conn
            .query_row(&sql, params![member_id], Self::map_redemption)
            .optional()?;
        Ok(redemption)
    }

    pub fn find_redemption_by_id(&self, redeem_id: &str) -> RepositoryResult<Option<Redemption>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {REDEMPTION_COLUMNS}
            FROM card_redeem r JOIN cards c ON c.card_id = r.card_id
            WHERE r.redeem_id = ?1 AND r.deleted_at IS NULL
            "#
        );
        let redemption = conn
            .query_row(&sql, params![redeem_id], Self::map_redemption)
            .optional()?;
        Ok(redemption)
    }

    /// 日期范围内的核销（含首尾,按班次日期升序）
    ///
    /// # 返回
    /// 每条核销附带卡号与会员信息,供孤儿扫描做排除比对
    pub fn find_redemptions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> RepositoryResult<Vec<RedemptionView>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {REDEMPTION_COLUMNS}, c.serial_number, m.name, m.identity_number
            FROM card_redeem r
            JOIN cards c ON c.card_id = r.card_id
            LEFT JOIN members m ON m.member_id = c.member_id
            WHERE r.shift_date BETWEEN ?1 AND ?2 AND r.deleted_at IS NULL
            ORDER BY r.shift_date ASC, r.created_at ASC, r.rowid ASC
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok(RedemptionView {
                redemption: Self::map_redemption(row)?,
                serial_number: row.get(8)?,
                member_name: row.get(9)?,
                member_nik: row.get(10)?,
            })
        })?;

        let mut views = Vec::new();
        for view in rows {
            views.push(view?);
        }
        Ok(views)
    }

    // ==========================================
    // 全量装载（匹配快照）
    // ==========================================

    /// 全部卡（按录入顺序）
    pub fn load_all_cards(&self) -> RepositoryResult<Vec<Card>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT card_id, serial_number, member_id FROM cards ORDER BY rowid ASC")?;
        let cards = stmt
            .query_map([], Self::map_card)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(cards)
    }

    /// 全部会员（按录入顺序）
    pub fn load_all_members(&self) -> RepositoryResult<Vec<Member>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare("SELECT member_id, name, identity_number FROM members ORDER BY rowid ASC")?;
        let members = stmt
            .query_map([], Self::map_member)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(members)
    }

    /// 全部有效核销
    pub fn load_all_redemptions(&self) -> RepositoryResult<Vec<Redemption>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"
            SELECT {REDEMPTION_COLUMNS}
            FROM card_redeem r JOIN cards c ON c.card_id = r.card_id
            WHERE r.deleted_at IS NULL
            ORDER BY r.rowid ASC
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let redemptions = stmt
            .query_map([], Self::map_redemption)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(redemptions)
    }

    // ==========================================
    // 明细展示
    // ==========================================

    /// 组装命中的卡/会员/核销信息
    ///
    /// # 返回
    /// - Ok(None): 卡已不存在
    pub fn describe_match(
        &self,
        card_id: &str,
        redeem_id: Option<&str>,
    ) -> RepositoryResult<Option<MatchedInternalRecord>> {
        let card = match self.find_card_by_id(card_id)? {
            Some(card) => card,
            None => return Ok(None),
        };

        let member = match card.member_id.as_deref() {
            Some(member_id) => self.find_member_by_id(member_id)?,
            None => None,
        };

        let redemption = match redeem_id {
            Some(id) => self.find_redemption_by_id(id)?,
            None => None,
        };

        Ok(Some(MatchedInternalRecord {
            card_id: card.card_id,
            serial_number: Some(card.serial_number),
            member_name: member.as_ref().map(|m| m.name.clone()),
            member_nik: member.map(|m| m.identity_number),
            redeem_id: redemption.as_ref().map(|r| r.redeem_id.clone()),
            redeem_date: redemption.as_ref().map(|r| r.shift_date),
            redeem_station: redemption.as_ref().and_then(|r| r.station_name.clone()),
            redeem_type: redemption.and_then(|r| r.redeem_type),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> ReferenceRepository {
        let conn = Connection::open_in_memory().unwrap();
        let repo = ReferenceRepository::new(Arc::new(Mutex::new(conn))).unwrap();

        repo.insert_member(&Member {
            member_id: "M1".to_string(),
            name: "Budi".to_string(),
            identity_number: "3174".to_string(),
        })
        .unwrap();
        repo.insert_card(&Card {
            card_id: "C1".to_string(),
            serial_number: "0125".to_string(),
            member_id: Some("M1".to_string()),
        })
        .unwrap();
        repo
    }

    fn redemption(id: &str, date: NaiveDate, created_at: &str) -> Redemption {
        Redemption {
            redeem_id: id.to_string(),
            card_id: "C1".to_string(),
            member_id: None,
            shift_date: date,
            station_name: Some("Halim".to_string()),
            redeem_type: Some("SINGLE".to_string()),
            created_at: NaiveDateTime::parse_from_str(created_at, "%Y-%m-%d %H:%M:%S").unwrap(),
            seq: 0,
        }
    }

    fn ymd(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    #[test]
    fn test_find_redemption_prefers_latest_then_insertion_order() {
        let repo = setup();
        repo.insert_redemption(&redemption("R1", ymd(14), "2026-01-14 08:00:00")).unwrap();
        repo.insert_redemption(&redemption("R2", ymd(14), "2026-01-14 09:00:00")).unwrap();
        repo.insert_redemption(&redemption("R3", ymd(14), "2026-01-14 09:00:00")).unwrap();

        let found = repo.find_redemption("M1", ymd(14)).unwrap().unwrap();
        assert_eq!(found.redeem_id, "R3");
        assert_eq!(found.member_id.as_deref(), Some("M1"));
        assert!(repo.find_redemption("M1", ymd(15)).unwrap().is_none());
    }

    #[test]
    fn test_soft_deleted_redemption_invisible() {
        let repo = setup();
        repo.insert_redemption(&redemption("R1", ymd(14), "2026-01-14 08:00:00")).unwrap();
        repo.soft_delete_redemption("R1", ymd(15).and_hms_opt(0, 0, 0).unwrap())
            .unwrap();

        assert!(repo.find_redemption("M1", ymd(14)).unwrap().is_none());
        assert!(repo.find_latest_redemption("M1").unwrap().is_none());
        assert!(repo.find_redemptions_in_range(ymd(1), ymd(31)).unwrap().is_empty());
        assert!(repo.load_all_redemptions().unwrap().is_empty());
    }

    #[test]
    fn test_redemptions_in_range_inclusive_with_context() {
        let repo = setup();
        repo.insert_redemption(&redemption("R1", ymd(13), "2026-01-13 08:00:00")).unwrap();
        repo.insert_redemption(&redemption("R2", ymd(14), "2026-01-14 08:00:00")).unwrap();
        repo.insert_redemption(&redemption("R3", ymd(16), "2026-01-16 08:00:00")).unwrap();

        let views = repo.find_redemptions_in_range(ymd(13), ymd(14)).unwrap();
        let ids: Vec<&str> = views.iter().map(|v| v.redemption.redeem_id.as_str()).collect();
        assert_eq!(ids, vec!["R1", "R2"]);
        assert_eq!(views[0].serial_number.as_deref(), Some("0125"));
        assert_eq!(views[0].member_nik.as_deref(), Some("3174"));
    }

    #[test]
    fn test_describe_match() {
        let repo = setup();
        repo.insert_redemption(&redemption("R1", ymd(14), "2026-01-14 08:00:00")).unwrap();

        let view = repo.describe_match("C1", Some("R1")).unwrap().unwrap();
        assert_eq!(view.member_name.as_deref(), Some("Budi"));
        assert_eq!(view.redeem_date, Some(ymd(14)));
        assert_eq!(view.redeem_station.as_deref(), Some("Halim"));

        let card_only = repo.describe_match("C1", None).unwrap().unwrap();
        assert!(card_only.redeem_id.is_none());
        assert!(repo.describe_match("C404", None).unwrap().is_none());
    }
}
