// ==========================================
// FWC 对账引擎 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为（外键级联删除依赖 foreign_keys）
// - 统一 busy_timeout，减少并发写入时的偶发 busy 错误
// - 记录 schema_version，旧库上运行时给出告警
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;
use tracing::{info, warn};

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
///
/// 各仓储以 `CREATE TABLE IF NOT EXISTS` 建表; 版本号只用于提示,不做自动迁移。
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 新库写入当前 schema_version; 已有库版本不一致时告警
///
/// # 返回
/// 写入/读取后的版本号
pub fn ensure_schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    match read_schema_version(conn)? {
        Some(v) => {
            if v != CURRENT_SCHEMA_VERSION {
                warn!(
                    found = v,
                    expected = CURRENT_SCHEMA_VERSION,
                    "数据库 schema_version 与当前代码不一致"
                );
            }
            Ok(v)
        }
        None => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS schema_version (
                  version INTEGER NOT NULL,
                  applied_at TEXT NOT NULL DEFAULT (datetime('now'))
                );
                "#,
            )?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [CURRENT_SCHEMA_VERSION],
            )?;
            info!(version = CURRENT_SCHEMA_VERSION, "初始化 schema_version");
            Ok(CURRENT_SCHEMA_VERSION)
        }
    }
}
