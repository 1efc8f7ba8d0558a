// ==========================================
// FWC 对账引擎 - 对账配置读取 Trait
// ==========================================
// 职责: 定义导入/匹配/查询所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use async_trait::async_trait;
use std::error::Error;

pub type ConfigError = Box<dyn Error + Send + Sync>;

// ==========================================
// ReconConfigReader Trait
// ==========================================
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait ReconConfigReader: Send + Sync {
    /// 合作方卡号前缀（大小写敏感）
    ///
    /// # 默认值
    /// - "FWC-"
    async fn get_partner_serial_prefix(&self) -> Result<String, ConfigError>;

    /// 合作方证件号前缀（大小写不敏感）
    ///
    /// # 默认值
    /// - "FW"
    async fn get_partner_identity_prefix(&self) -> Result<String, ConfigError>;

    /// 表头扫描行数
    ///
    /// # 默认值
    /// - 10
    async fn get_header_scan_rows(&self) -> Result<usize, ConfigError>;

    /// 分页 limit 上限
    ///
    /// # 默认值
    /// - 500
    async fn get_max_page_limit(&self) -> Result<u32, ConfigError>;

    /// 批次明细中孤儿核销的返回上限
    ///
    /// # 默认值
    /// - 100
    async fn get_orphan_limit(&self) -> Result<usize, ConfigError>;

    /// 匹配工作线程数
    ///
    /// # 默认值
    /// - 4
    async fn get_match_workers(&self) -> Result<usize, ConfigError>;
}
