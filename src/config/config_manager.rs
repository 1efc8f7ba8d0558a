// ==========================================
// FWC 对账引擎 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写
// 存储: config_kv 表 (scope_id + key → value)
// 缺省: 表中无记录或值无法解析时使用默认值
// ==========================================

use crate::config::recon_config_trait::{ConfigError, ReconConfigReader};
use crate::db::open_sqlite_connection;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::warn;

// ==========================================
// ReconConfig - 配置快照
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconConfig {
    pub partner_serial_prefix: String,
    pub partner_identity_prefix: String,
    pub header_scan_rows: usize,
    pub max_page_limit: u32,
    pub orphan_limit: usize,
    pub match_workers: usize,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            partner_serial_prefix: defaults::PARTNER_SERIAL_PREFIX.to_string(),
            partner_identity_prefix: defaults::PARTNER_IDENTITY_PREFIX.to_string(),
            header_scan_rows: defaults::HEADER_SCAN_ROWS,
            max_page_limit: defaults::MAX_PAGE_LIMIT,
            orphan_limit: defaults::ORPHAN_LIMIT,
            match_workers: defaults::MATCH_WORKERS,
        }
    }
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, ConfigError> {
        let conn = open_sqlite_connection(db_path)?;
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    /// 从已有连接创建 ConfigManager
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, ConfigError> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            conn_guard.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS config_kv (
                  scope_id TEXT NOT NULL DEFAULT 'global',
                  key TEXT NOT NULL,
                  value TEXT NOT NULL,
                  updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                  PRIMARY KEY (scope_id, key)
                );
                "#,
            )?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    pub fn get_global_config_value(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let value = conn
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 写入 global 配置（UPSERT）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            r#"
            INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
            ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// 读取并解析数值配置; 非法值记录告警后回落默认值
    fn get_parsed_or_default<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + Copy,
    {
        match self.get_global_config_value(key)? {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    warn!(key = key, value = %raw, "配置值无法解析,使用默认值");
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }

    /// 读取全部对账配置为一个快照
    pub async fn load_recon_config(&self) -> Result<ReconConfig, ConfigError> {
        Ok(ReconConfig {
            partner_serial_prefix: self.get_partner_serial_prefix().await?,
            partner_identity_prefix: self.get_partner_identity_prefix().await?,
            header_scan_rows: self.get_header_scan_rows().await?,
            max_page_limit: self.get_max_page_limit().await?,
            orphan_limit: self.get_orphan_limit().await?,
            match_workers: self.get_match_workers().await?,
        })
    }
}

#[async_trait]
impl ReconConfigReader for ConfigManager {
    async fn get_partner_serial_prefix(&self) -> Result<String, ConfigError> {
        // 空字符串是合法值（关闭前缀剥离）
        Ok(self
            .get_global_config_value(config_keys::PARTNER_SERIAL_PREFIX)?
            .unwrap_or_else(|| defaults::PARTNER_SERIAL_PREFIX.to_string()))
    }

    async fn get_partner_identity_prefix(&self) -> Result<String, ConfigError> {
        Ok(self
            .get_global_config_value(config_keys::PARTNER_IDENTITY_PREFIX)?
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| defaults::PARTNER_IDENTITY_PREFIX.to_string()))
    }

    async fn get_header_scan_rows(&self) -> Result<usize, ConfigError> {
        let v = self.get_parsed_or_default(config_keys::HEADER_SCAN_ROWS, defaults::HEADER_SCAN_ROWS)?;
        Ok(v.max(1))
    }

    async fn get_max_page_limit(&self) -> Result<u32, ConfigError> {
        let v = self.get_parsed_or_default(config_keys::MAX_PAGE_LIMIT, defaults::MAX_PAGE_LIMIT)?;
        Ok(v.max(1))
    }

    async fn get_orphan_limit(&self) -> Result<usize, ConfigError> {
        self.get_parsed_or_default(config_keys::ORPHAN_LIMIT, defaults::ORPHAN_LIMIT)
    }

    async fn get_match_workers(&self) -> Result<usize, ConfigError> {
        let v = self.get_parsed_or_default(config_keys::MATCH_WORKERS, defaults::MATCH_WORKERS)?;
        Ok(v.max(1))
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 导入
    pub const PARTNER_SERIAL_PREFIX: &str = "partner_serial_prefix";
    pub const PARTNER_IDENTITY_PREFIX: &str = "partner_identity_prefix";
    pub const HEADER_SCAN_ROWS: &str = "header_scan_rows";

    // 查询
    pub const MAX_PAGE_LIMIT: &str = "max_page_limit";
    pub const ORPHAN_LIMIT: &str = "orphan_limit";

    // 匹配
    pub const MATCH_WORKERS: &str = "match_workers";
}

mod defaults {
    pub const PARTNER_SERIAL_PREFIX: &str = "FWC-";
    pub const PARTNER_IDENTITY_PREFIX: &str = "FW";
    pub const HEADER_SCAN_ROWS: usize = 10;
    pub const MAX_PAGE_LIMIT: u32 = 500;
    pub const ORPHAN_LIMIT: usize = 100;
    pub const MATCH_WORKERS: usize = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConfigManager {
        let conn = Connection::open_in_memory().unwrap();
        ConfigManager::from_connection(Arc::new(Mutex::new(conn))).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_when_table_empty() {
        let config = manager().load_recon_config().await.unwrap();
        assert_eq!(config, ReconConfig::default());
        assert_eq!(config.partner_serial_prefix, "FWC-");
        assert_eq!(config.partner_identity_prefix, "FW");
        assert_eq!(config.max_page_limit, 500);
    }

    #[tokio::test]
    async fn test_overrides_and_invalid_values() {
        let manager = manager();
        manager.set_global_config_value(config_keys::ORPHAN_LIMIT, "25").unwrap();
        manager.set_global_config_value(config_keys::MATCH_WORKERS, "0").unwrap();
        manager.set_global_config_value(config_keys::MAX_PAGE_LIMIT, "lots").unwrap();
        manager.set_global_config_value(config_keys::PARTNER_SERIAL_PREFIX, "").unwrap();
        manager.set_global_config_value(config_keys::PARTNER_IDENTITY_PREFIX, " ").unwrap();

        let config = manager.load_recon_config().await.unwrap();
        assert_eq!(config.orphan_limit, 25);
        assert_eq!(config.match_workers, 1);
        assert_eq!(config.max_page_limit, 500);
        assert_eq!(config.partner_serial_prefix, "");
        assert_eq!(config.partner_identity_prefix, "");
    }

    #[test]
    fn test_upsert_overwrites() {
        let manager = manager();
        manager.set_global_config_value("k", "1").unwrap();
        manager.set_global_config_value("k", "2").unwrap();
        assert_eq!(manager.get_global_config_value("k").unwrap().as_deref(), Some("2"));
        assert!(manager.get_global_config_value("missing").unwrap().is_none());
    }
}
