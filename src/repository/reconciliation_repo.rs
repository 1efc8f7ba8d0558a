// ==========================================
// FWC 对账引擎 - 对账批次仓储
// ==========================================
// 表: recon_batch / recon_external_record / recon_match_outcome
// 所有权: 外部记录与匹配结果随批次级联删除
// 并发: PENDING → MATCHING 通过条件 UPDATE 实现 CAS
// ==========================================

use crate::domain::reconciliation::{
    ExternalRecord, MatchDetails, MatchOutcome, ReconciliationBatch, RowRejection,
};
use crate::domain::types::BatchStatus;
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::sync::{Arc, Mutex};

const BATCH_COLUMNS: &str = r#"
    batch_id, source_file_name, total_rows, matched_rows, unmatched_rows, rejected_rows,
    status, created_by, created_at, matched_by, matched_at, failure_reason
"#;

// ==========================================
// ReconciliationRepository - 对账批次仓储
// ==========================================
pub struct ReconciliationRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ReconciliationRepository {
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
            CREATE TABLE IF NOT EXISTS recon_batch (
              batch_id TEXT PRIMARY KEY,
              source_file_name TEXT NOT NULL,
              total_rows INTEGER NOT NULL,
              matched_rows INTEGER NOT NULL DEFAULT 0,
              unmatched_rows INTEGER NOT NULL DEFAULT 0,
              rejected_rows INTEGER NOT NULL DEFAULT 0,
              status TEXT NOT NULL CHECK(status IN ('PENDING', 'MATCHING', 'COMPLETED', 'FAILED')),
              created_by TEXT,
              created_at TEXT NOT NULL,
              matched_by TEXT,
              matched_at TEXT,
              failure_reason TEXT,
              rejections_json TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS recon_external_record (
              batch_id TEXT NOT NULL REFERENCES recon_batch(batch_id) ON DELETE CASCADE,
              row_number INTEGER NOT NULL,
              identity_number TEXT NOT NULL,
              ticketing_date TEXT NOT NULL,
              raw_serial_code TEXT NOT NULL DEFAULT '',
              cleaned_serial_code TEXT NOT NULL DEFAULT '',
              PRIMARY KEY (batch_id, row_number)
            );

            CREATE TABLE IF NOT EXISTS recon_match_outcome (
              batch_id TEXT NOT NULL REFERENCES recon_batch(batch_id) ON DELETE CASCADE,
              row_number INTEGER NOT NULL,
              is_matched INTEGER NOT NULL,
              matched_card_id TEXT,
              matched_redeem_id TEXT,
              match_details_json TEXT,
              updated_at TEXT NOT NULL,
              PRIMARY KEY (batch_id, row_number)
            );

            CREATE INDEX IF NOT EXISTS idx_recon_batch_status ON recon_batch(status);
            CREATE INDEX IF NOT EXISTS idx_recon_batch_created_at ON recon_batch(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_recon_outcome_matched ON recon_match_outcome(batch_id, is_matched);
            "#,
        )?;
        Ok(())
    }

    // ==========================================
    // 行映射
    // ==========================================

    fn map_batch(row: &Row) -> SqliteResult<ReconciliationBatch> {
        let status_raw: String = row.get(6)?;
        let status = BatchStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                Type::Text,
                format!("未知批次状态: {}", status_raw).into(),
            )
        })?;

        Ok(ReconciliationBatch {
            batch_id: row.get(0)?,
            source_file_name: row.get(1)?,
            total_rows: row.get(2)?,
            matched_rows: row.get(3)?,
            unmatched_rows: row.get(4)?,
            rejected_rows: row.get(5)?,
            status,
            created_by: row.get(7)?,
            created_at: row.get::<_, DateTime<Utc>>(8)?,
            matched_by: row.get(9)?,
            matched_at: row.get::<_, Option<DateTime<Utc>>>(10)?,
            failure_reason: row.get(11)?,
        })
    }

    /// 外部记录列在前 5 列
    fn map_external_record(row: &Row) -> SqliteResult<ExternalRecord> {
        Ok(ExternalRecord {
            row_number: row.get::<_, i64>(0)? as usize,
            identity_number: row.get(1)?,
            ticketing_date: row.get::<_, NaiveDate>(2)?,
            raw_serial_code: row.get(3)?,
            cleaned_serial_code: row.get(4)?,
        })
    }

    /// 外部记录 LEFT JOIN 匹配结果（无结果行 ⇒ 尚未匹配）
    fn map_outcome(row: &Row) -> SqliteResult<MatchOutcome> {
        let external_record = Self::map_external_record(row)?;

        let details_json: Option<String> = row.get(8)?;
        let match_details = match details_json {
            Some(json) => Some(serde_json::from_str::<MatchDetails>(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e))
            })?),
            None => None,
        };

        Ok(MatchOutcome {
            external_record,
            is_matched: row.get::<_, Option<bool>>(5)?.unwrap_or(false),
            matched_card_id: row.get(6)?,
            matched_redeem_id: row.get(7)?,
            match_details,
        })
    }

    // ==========================================
    // 导入
    // ==========================================

    /// 在同一事务内写入批次与全部外部记录
    pub fn insert_batch_with_records(
        &self,
        batch: &ReconciliationBatch,
        records: &[ExternalRecord],
        rejections: &[RowRejection],
    ) -> RepositoryResult<()> {
        let rejections_json = serde_json::to_string(rejections)?;

        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO recon_batch (
                batch_id, source_file_name, total_rows, matched_rows, unmatched_rows, rejected_rows,
                status, created_by, created_at, matched_by, matched_at, failure_reason, rejections_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                batch.batch_id,
                batch.source_file_name,
                batch.total_rows,
                batch.matched_rows,
                batch.unmatched_rows,
                batch.rejected_rows,
                batch.status.as_str(),
                batch.created_by,
                batch.created_at,
                batch.matched_by,
                batch.matched_at,
                batch.failure_reason,
                rejections_json,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO recon_external_record (
                    batch_id, row_number, identity_number, ticketing_date,
                    raw_serial_code, cleaned_serial_code
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for record in records {
                stmt.execute(params![
                    batch.batch_id,
                    record.row_number as i64,
                    record.identity_number,
                    record.ticketing_date,
                    record.raw_serial_code,
                    record.cleaned_serial_code,
                ])?;
            }
        }

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(())
    }

    // ==========================================
    // 批次查询
    // ==========================================

    pub fn find_batch(&self, batch_id: &str) -> RepositoryResult<Option<ReconciliationBatch>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {BATCH_COLUMNS} FROM recon_batch WHERE batch_id = ?1");
        let batch = conn
            .query_row(&sql, params![batch_id], Self::map_batch)
            .optional()?;
        Ok(batch)
    }

    /// 导入时记录的行级拒绝明细
    pub fn find_rejections(&self, batch_id: &str) -> RepositoryResult<Vec<RowRejection>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT rejections_json FROM recon_batch WHERE batch_id = ?1",
                params![batch_id],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(RepositoryError::NotFound {
                entity: "ReconciliationBatch".to_string(),
                id: batch_id.to_string(),
            }),
        }
    }

    /// 分页查询批次（创建时间倒序）
    ///
    /// # 返回
    /// (当前页批次, 满足过滤条件的总数)
    pub fn list_batches(
        &self,
        status: Option<BatchStatus>,
        limit: u32,
        offset: u64,
    ) -> RepositoryResult<(Vec<ReconciliationBatch>, i64)> {
        let conn = self.get_conn()?;
        let status_str = status.map(|s| s.as_str());

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM recon_batch WHERE (?1 IS NULL OR status = ?1)",
            params![status_str],
            |row| row.get(0),
        )?;

        let sql = format!(
            r#"
            SELECT {BATCH_COLUMNS} FROM recon_batch
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2 OFFSET ?3
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let batches = stmt
            .query_map(params![status_str, limit, offset as i64], Self::map_batch)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok((batches, total))
    }

    // ==========================================
    // 外部记录与匹配结果
    // ==========================================

    /// 批次全部外部记录（按行号）
    pub fn load_external_records(&self, batch_id: &str) -> RepositoryResult<Vec<ExternalRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT row_number, identity_number, ticketing_date, raw_serial_code, cleaned_serial_code
            FROM recon_external_record
            WHERE batch_id = ?1
            ORDER BY row_number ASC
            "#,
        )?;
        let records = stmt
            .query_map(params![batch_id], Self::map_external_record)?
            .collect::<SqliteResult<Vec<_>>>()?;
        Ok(records)
    }

    /// 批次售票日期范围
    pub fn record_date_range(
        &self,
        batch_id: &str,
    ) -> RepositoryResult<Option<(NaiveDate, NaiveDate)>> {
        let conn = self.get_conn()?;
        let (start, end): (Option<NaiveDate>, Option<NaiveDate>) = conn.query_row(
            r#"
            SELECT MIN(ticketing_date), MAX(ticketing_date)
            FROM recon_external_record WHERE batch_id = ?1
            "#,
            params![batch_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(start.zip(end))
    }

    /// 分页查询匹配结果
    ///
    /// # 参数
    /// - is_matched: None 表示全部
    /// - limit: None 表示不分页（导出使用）
    pub fn list_outcomes(
        &self,
        batch_id: &str,
        is_matched: Option<bool>,
        limit: Option<u32>,
        offset: u64,
    ) -> RepositoryResult<(Vec<MatchOutcome>, i64)> {
        let conn = self.get_conn()?;

        let total: i64 = conn.query_row(
            r#"
            SELECT COUNT(*)
            FROM recon_external_record e
            LEFT JOIN recon_match_outcome o
              ON o.batch_id = e.batch_id AND o.row_number = e.row_number
            WHERE e.batch_id = ?1 AND (?2 IS NULL OR COALESCE(o.is_matched, 0) = ?2)
            "#,
            params![batch_id, is_matched],
            |row| row.get(0),
        )?;

        // SQLite: LIMIT -1 表示不限
        let limit_sql: i64 = limit.map(i64::from).unwrap_or(-1);
        let mut stmt = conn.prepare(
            r#"
            SELECT e.row_number, e.identity_number, e.ticketing_date, e.raw_serial_code,
                   e.cleaned_serial_code, o.is_matched, o.matched_card_id, o.matched_redeem_id,
                   o.match_details_json
            FROM recon_external_record e
            LEFT JOIN recon_match_outcome o
              ON o.batch_id = e.batch_id AND o.row_number = e.row_number
            WHERE e.batch_id = ?1 AND (?2 IS NULL OR COALESCE(o.is_matched, 0) = ?2)
            ORDER BY e.row_number ASC
            LIMIT ?3 OFFSET ?4
            "#,
        )?;
        let outcomes = stmt
            .query_map(
                params![batch_id, is_matched, limit_sql, offset as i64],
                Self::map_outcome,
            )?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok((outcomes, total))
    }

    /// 写入一组匹配结果（按 (batch_id, row_number) 幂等覆盖）
    pub fn upsert_outcomes(&self, batch_id: &str, outcomes: &[MatchOutcome]) -> RepositoryResult<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        let now = Utc::now();

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO recon_match_outcome (
                    batch_id, row_number, is_matched, matched_card_id, matched_redeem_id,
                    match_details_json, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(batch_id, row_number) DO UPDATE SET
                    is_matched = excluded.is_matched,
                    matched_card_id = excluded.matched_card_id,
                    matched_redeem_id = excluded.matched_redeem_id,
                    match_details_json = excluded.match_details_json,
                    updated_at = excluded.updated_at
                "#,
            )?;
            for outcome in outcomes {
                let details_json = outcome
                    .match_details
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    batch_id,
                    outcome.external_record.row_number as i64,
                    outcome.is_matched,
                    outcome.matched_card_id,
                    outcome.matched_redeem_id,
                    details_json,
                    now,
                ])?;
            }
        }

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(outcomes.len())
    }

    // ==========================================
    // 状态迁移
    // ==========================================

    /// PENDING → MATCHING（比较并交换）
    ///
    /// # 返回
    /// - Ok(true): 本调用获得匹配权
    /// - Ok(false): 批次不存在或不处于 PENDING
    pub fn try_begin_matching(&self, batch_id: &str, operator: Option<&str>) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE recon_batch
            SET status = 'MATCHING', matched_by = ?2
            WHERE batch_id = ?1 AND status = 'PENDING'
            "#,
            params![batch_id, operator],
        )?;
        Ok(affected == 1)
    }

    /// MATCHING → COMPLETED
    pub fn complete_batch(
        &self,
        batch_id: &str,
        matched_rows: i64,
        unmatched_rows: i64,
        matched_at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE recon_batch
            SET status = 'COMPLETED', matched_rows = ?2, unmatched_rows = ?3, matched_at = ?4
            WHERE batch_id = ?1 AND status = 'MATCHING'
            "#,
            params![batch_id, matched_rows, unmatched_rows, matched_at],
        )?;
        if affected == 0 {
            return Err(RepositoryError::InvalidStateTransition {
                from: self.current_status(&conn, batch_id)?,
                to: BatchStatus::Completed.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// MATCHING → FAILED
    pub fn fail_batch(&self, batch_id: &str, reason: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE recon_batch
            SET status = 'FAILED', failure_reason = ?2
            WHERE batch_id = ?1 AND status = 'MATCHING'
            "#,
            params![batch_id, reason],
        )?;
        if affected == 0 {
            return Err(RepositoryError::InvalidStateTransition {
                from: self.current_status(&conn, batch_id)?,
                to: BatchStatus::Failed.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn current_status(&self, conn: &Connection, batch_id: &str) -> RepositoryResult<String> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM recon_batch WHERE batch_id = ?1",
                params![batch_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.unwrap_or_else(|| "MISSING".to_string()))
    }

    // ==========================================
    // 删除
    // ==========================================

    /// 删除批次及其外部记录、匹配结果
    ///
    /// # 返回
    /// - Ok(false): 批次不存在
    pub fn delete_batch(&self, batch_id: &str) -> RepositoryResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        // 外键级联依赖连接级 PRAGMA,这里显式删除子表
        tx.execute(
            "DELETE FROM recon_match_outcome WHERE batch_id = ?1",
            params![batch_id],
        )?;
        tx.execute(
            "DELETE FROM recon_external_record WHERE batch_id = ?1",
            params![batch_id],
        )?;
        let affected = tx.execute("DELETE FROM recon_batch WHERE batch_id = ?1", params![batch_id])?;

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(affected == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MatchReason;

    fn setup() -> ReconciliationRepository {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        ReconciliationRepository::new(Arc::new(Mutex::new(conn))).unwrap()
    }

    fn record(row_number: usize, day: u32) -> ExternalRecord {
        ExternalRecord {
            row_number,
            identity_number: format!("ID{}", row_number),
            ticketing_date: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
            raw_serial_code: String::new(),
            cleaned_serial_code: String::new(),
        }
    }

    fn seed_batch(repo: &ReconciliationRepository, batch_id: &str) {
        let batch = ReconciliationBatch::new_pending(
            batch_id.to_string(),
            "report.csv".to_string(),
            3,
            1,
            Some("admin".to_string()),
        );
        let rejections = vec![RowRejection {
            row_number: 6,
            reason: crate::domain::types::RowRejectReason::InvalidDate,
            raw_value: Some("x".to_string()),
        }];
        repo.insert_batch_with_records(&batch, &[record(3, 14), record(4, 12), record(5, 16)], &rejections)
            .unwrap();
    }

    fn matched(record: ExternalRecord) -> MatchOutcome {
        MatchOutcome {
            external_record: record,
            is_matched: true,
            matched_card_id: Some("C1".to_string()),
            matched_redeem_id: None,
            match_details: Some(MatchDetails {
                serial_match: true,
                nik_match: false,
                date_match: false,
                serial_attempted: true,
                partial_fwc: None,
                reason: MatchReason::SerialMatchNoRedeemOnDate,
            }),
        }
    }

    #[test]
    fn test_insert_and_find_batch() {
        let repo = setup();
        seed_batch(&repo, "B1");

        let batch = repo.find_batch("B1").unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.total_rows, 3);
        assert_eq!(batch.rejected_rows, 1);
        assert_eq!(batch.created_by.as_deref(), Some("admin"));
        assert_eq!(repo.find_rejections("B1").unwrap().len(), 1);

        let records = repo.load_external_records("B1").unwrap();
        assert_eq!(records.iter().map(|r| r.row_number).collect::<Vec<_>>(), vec![3, 4, 5]);

        let (start, end) = repo.record_date_range("B1").unwrap().unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2026, 1, 12).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2026, 1, 16).unwrap());
    }

    #[test]
    fn test_begin_matching_is_compare_and_swap() {
        let repo = setup();
        seed_batch(&repo, "B1");

        assert!(repo.try_begin_matching("B1", Some("ops")).unwrap());
        assert!(!repo.try_begin_matching("B1", Some("ops")).unwrap());
        assert!(!repo.try_begin_matching("B404", None).unwrap());
    }

    #[test]
    fn test_upsert_outcome_is_at_most_once_per_row() {
        let repo = setup();
        seed_batch(&repo, "B1");

        let first = matched(record(3, 14));
        repo.upsert_outcomes("B1", &[first.clone()]).unwrap();
        repo.upsert_outcomes("B1", &[first]).unwrap();

        let (all, total) = repo.list_outcomes("B1", None, Some(50), 0).unwrap();
        assert_eq!(total, 3);
        assert_eq!(all.len(), 3);
        assert!(all[0].is_matched);
        // 未写入结果的行 match_details 为空
        assert!(all[1].match_details.is_none());

        let (only_matched, matched_total) = repo.list_outcomes("B1", Some(true), Some(50), 0).unwrap();
        assert_eq!(matched_total, 1);
        assert_eq!(only_matched[0].reason(), Some(MatchReason::SerialMatchNoRedeemOnDate));

        let (unmatched, unmatched_total) = repo.list_outcomes("B1", Some(false), Some(1), 1).unwrap();
        assert_eq!(unmatched_total, 2);
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].external_record.row_number, 5);
    }

    #[test]
    fn test_complete_requires_matching_state() {
        let repo = setup();
        seed_batch(&repo, "B1");

        let err = repo.complete_batch("B1", 1, 2, Utc::now()).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidStateTransition { ref from, .. } if from == "PENDING"));

        repo.try_begin_matching("B1", None).unwrap();
        repo.complete_batch("B1", 1, 2, Utc::now()).unwrap();
        let batch = repo.find_batch("B1").unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.counts_consistent());
        assert!(batch.matched_at.is_some());
    }

    #[test]
    fn test_list_batches_with_status_filter() {
        let repo = setup();
        seed_batch(&repo, "B1");
        seed_batch(&repo, "B2");
        repo.try_begin_matching("B2", None).unwrap();
        repo.fail_batch("B2", "boom").unwrap();

        let (all, total) = repo.list_batches(None, 10, 0).unwrap();
        assert_eq!((all.len(), total), (2, 2));

        let (failed, failed_total) = repo.list_batches(Some(BatchStatus::Failed), 10, 0).unwrap();
        assert_eq!(failed_total, 1);
        assert_eq!(failed[0].failure_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_delete_batch_removes_children() {
        let repo = setup();
        seed_batch(&repo, "B1");
        repo.upsert_outcomes("B1", &[matched(record(3, 14))]).unwrap();

        assert!(repo.delete_batch("B1").unwrap());
        assert!(repo.find_batch("B1").unwrap().is_none());
        assert!(repo.load_external_records("B1").unwrap().is_empty());
        assert_eq!(repo.list_outcomes("B1", None, None, 0).unwrap().1, 0);
        assert!(!repo.delete_batch("B1").unwrap());
    }
}
