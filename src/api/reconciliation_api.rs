// ==========================================
// FWC 对账引擎 - 对账 API
// ==========================================
// 职责: 导入报表 / 触发匹配 / 批次列表 / 批次明细 / 删除批次 / 导出备份
// 约束: 所有操作共享同一数据库连接; 匹配在阻塞线程池中执行
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::{ConfigManager, ReconConfigReader};
use crate::db;
use crate::domain::reconciliation::{
    IngestSummary, MatchOutcome, MatchedInternalRecord, OrphanInternalRecord, Page, Pagination,
    ReconciliationBatch, RowRejection,
};
use crate::domain::types::BatchStatus;
use crate::engine::{BatchOrchestrator, MatchingOptions, OrphanScanner, ReferenceIndex};
use crate::importer::{ReportImporter, ReportImporterImpl, UniversalFileParser};
use crate::perf::{self, install_sqlite_tracing};
use crate::repository::{ReconciliationRepository, ReferenceRepository};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

// ==========================================
// 响应 DTO
// ==========================================

/// 导入响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub batch_id: String,
    pub source_file_name: String,
    /// 可用数据行数
    pub total_rows: i64,
    /// 被拒绝的行数（缺证件号 / 日期非法）
    pub rejected_rows: i64,
    pub skipped_blank_rows: usize,
    pub rejections: Vec<RowRejection>,
}

impl From<IngestSummary> for IngestResponse {
    fn from(summary: IngestSummary) -> Self {
        Self {
            batch_id: summary.batch.batch_id,
            source_file_name: summary.batch.source_file_name,
            total_rows: summary.batch.total_rows,
            rejected_rows: summary.batch.rejected_rows,
            skipped_blank_rows: summary.skipped_blank_rows,
            rejections: summary.rejections,
        }
    }
}

/// 多文件导入中单个文件的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIngestResult {
    pub file_path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<IngestResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 明细行: 匹配结果 + 命中的内部记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    #[serde(flatten)]
    pub outcome: MatchOutcome,
    pub fwc: Option<MatchedInternalRecord>,
}

/// 批次明细响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetailResponse {
    pub batch: ReconciliationBatch,
    pub records: Page<RecordView>,
    /// 仅 COMPLETED 批次有值
    pub orphans: Vec<OrphanInternalRecord>,
    pub rejections: Vec<RowRejection>,
}

/// 删除批次响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBatchResponse {
    pub batch_id: String,
    pub deleted: bool,
}

/// 导出响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub batch_id: String,
    pub file_path: String,
    pub rows: usize,
}

/// 导出文件表头
const EXPORT_HEADER: [&str; 7] = [
    "batch_id",
    "row_number",
    "serial_number",
    "identity_number",
    "ticketing_date",
    "is_matched",
    "reason",
];

// ==========================================
// ReconciliationApi - 对账 API
// ==========================================
pub struct ReconciliationApi {
    recon_repo: Arc<ReconciliationRepository>,
    reference_repo: Arc<ReferenceRepository>,
    config: Arc<ConfigManager>,
    importer: ReportImporterImpl<ConfigManager>,
}

impl ReconciliationApi {
    /// 打开数据库并创建 API 实例
    ///
    /// # 参数
    /// - db_path: SQLite 数据库文件路径（不存在时自动创建）
    pub fn new(db_path: &str) -> ApiResult<Self> {
        let mut conn = db::open_sqlite_connection(db_path)
            .map_err(|e| ApiError::DatabaseConnectionError(e.to_string()))?;
        install_sqlite_tracing(&mut conn);
        db::ensure_schema_version(&conn).map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    /// 基于已有连接创建 API 实例（连接需已完成 PRAGMA 配置）
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ApiResult<Self> {
        let recon_repo = Arc::new(ReconciliationRepository::new(conn.clone())?);
        let reference_repo = Arc::new(ReferenceRepository::new(conn.clone())?);
        let config = Arc::new(ConfigManager::from_connection(conn)?);
        let importer = ReportImporterImpl::new(
            recon_repo.clone(),
            config.clone(),
            Box::new(UniversalFileParser),
        );

        Ok(Self {
            recon_repo,
            reference_repo,
            config,
            importer,
        })
    }

    /// 参考数据仓储（卡 / 会员 / 核销）
    pub fn reference_repo(&self) -> Arc<ReferenceRepository> {
        self.reference_repo.clone()
    }

    /// 配置管理器
    pub fn config(&self) -> Arc<ConfigManager> {
        self.config.clone()
    }

    // ==========================================
    // 导入
    // ==========================================

    /// 导入合作方报表,创建 PENDING 批次
    ///
    /// # 返回
    /// - Ok(IngestResponse): 批次ID与行数统计
    /// - Err(NoUsableRows / MissingRequiredColumn / ...): 批次未创建
    pub async fn ingest_file(
        &self,
        file_path: &str,
        operator: Option<&str>,
    ) -> ApiResult<IngestResponse> {
        if file_path.trim().is_empty() {
            return Err(ApiError::InvalidInput("文件路径不能为空".to_string()));
        }

        let summary = self.importer.ingest_file(Path::new(file_path), operator).await?;
        Ok(IngestResponse::from(summary))
    }

    /// 并发导入多个报表; 每个文件独立成批,失败互不影响
    pub async fn ingest_files(
        &self,
        file_paths: Vec<String>,
        operator: Option<&str>,
    ) -> ApiResult<Vec<FileIngestResult>> {
        if file_paths.is_empty() {
            return Err(ApiError::InvalidInput("文件列表不能为空".to_string()));
        }

        let results = self.importer.ingest_files(file_paths.clone(), operator).await;
        Ok(file_paths
            .into_iter()
            .zip(results)
            .map(|(file_path, result)| match result {
                Ok(summary) => FileIngestResult {
                    file_path,
                    success: true,
                    result: Some(IngestResponse::from(summary)),
                    error: None,
                },
                Err(message) => FileIngestResult {
                    file_path,
                    success: false,
                    result: None,
                    error: Some(message),
                },
            })
            .collect())
    }

    // ==========================================
    // 匹配
    // ==========================================

    /// 触发批次匹配
    ///
    /// # 返回
    /// - Ok(ReconciliationBatch): COMPLETED 批次（含匹配计数）
    /// - Err(BatchAlreadyMatched / BatchNotFound / BatchMatchingInProgress / MatchingFailed)
    pub async fn trigger_match(
        &self,
        batch_id: &str,
        operator: Option<&str>,
    ) -> ApiResult<ReconciliationBatch> {
        if batch_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("批次ID不能为空".to_string()));
        }

        let workers = self.config.get_match_workers().await?;
        let orchestrator = BatchOrchestrator::new(
            self.recon_repo.clone(),
            self.reference_repo.clone(),
            MatchingOptions { workers },
        );

        let batch_id_owned = batch_id.to_string();
        let operator_owned = operator.map(str::to_string);
        let batch = perf::measure_blocking("recon_trigger_match", move || {
            orchestrator.run_matching(&batch_id_owned, operator_owned.as_deref())
        })
        .await
        .map_err(|e| ApiError::InternalError(format!("匹配任务异常终止: {}", e)))??;

        Ok(batch)
    }

    // ==========================================
    // 查询
    // ==========================================

    /// 分页查询批次
    ///
    /// # 参数
    /// - page: 页码（从 1 开始,0 视为 1）
    /// - limit: 每页数量（限制在 1..=max_page_limit）
    /// - status: 状态过滤（PENDING / MATCHING / COMPLETED / FAILED）
    pub async fn list_batches(
        &self,
        page: u32,
        limit: u32,
        status: Option<&str>,
    ) -> ApiResult<Page<ReconciliationBatch>> {
        let status = match status.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                BatchStatus::parse(&raw.to_uppercase())
                    .ok_or_else(|| ApiError::InvalidInput(format!("未知的批次状态: {}", raw)))?,
            ),
            None => None,
        };
        let (page, limit, offset) = self.normalize_paging(page, limit).await?;

        let (items, total) = perf::measure("recon_list_batches", || {
            self.recon_repo.list_batches(status, limit, offset)
        })?;
        Ok(Page {
            items,
            pagination: Pagination::new(total, page, limit),
        })
    }

    /// 批次明细: 分页匹配结果 + 孤儿核销 + 拒绝行
    ///
    /// # 参数
    /// - is_matched: None 表示全部
    pub async fn get_batch_detail(
        &self,
        batch_id: &str,
        page: u32,
        limit: u32,
        is_matched: Option<bool>,
    ) -> ApiResult<BatchDetailResponse> {
        let (page, limit, offset) = self.normalize_paging(page, limit).await?;
        let orphan_limit = self.config.get_orphan_limit().await?;

        perf::measure("recon_get_batch_detail", || -> ApiResult<BatchDetailResponse> {
            let batch = self
                .recon_repo
                .find_batch(batch_id)?
                .ok_or_else(|| ApiError::BatchNotFound(batch_id.to_string()))?;

            let (outcomes, total) =
                self.recon_repo
                    .list_outcomes(batch_id, is_matched, Some(limit), offset)?;
            let items = outcomes
                .into_iter()
                .map(|outcome| self.enrich(outcome))
                .collect::<ApiResult<Vec<_>>>()?;

            let orphans = if batch.status == BatchStatus::Completed {
                let index: Arc<dyn ReferenceIndex> = self.reference_repo.clone();
                OrphanScanner::new(self.recon_repo.clone(), index)
                    .find_orphans(batch_id, orphan_limit)?
            } else {
                Vec::new()
            };
            let rejections = self.recon_repo.find_rejections(batch_id)?;

            Ok(BatchDetailResponse {
                batch,
                records: Page {
                    items,
                    pagination: Pagination::new(total, page, limit),
                },
                orphans,
                rejections,
            })
        })
    }

    // ==========================================
    // 删除与导出
    // ==========================================

    /// 删除批次及其外部记录、匹配结果
    pub async fn delete_batch(&self, batch_id: &str) -> ApiResult<DeleteBatchResponse> {
        let deleted =
            perf::measure("recon_delete_batch", || self.recon_repo.delete_batch(batch_id))?;
        if !deleted {
            return Err(ApiError::BatchNotFound(batch_id.to_string()));
        }
        info!(batch_id = %batch_id, "批次已删除");

        Ok(DeleteBatchResponse {
            batch_id: batch_id.to_string(),
            deleted: true,
        })
    }

    /// 导出批次全部行（CSV 备份）
    ///
    /// # 参数
    /// - output_path: 输出文件路径（已存在则覆盖）
    pub async fn export_batch_csv(
        &self,
        batch_id: &str,
        output_path: &str,
    ) -> ApiResult<ExportResponse> {
        perf::measure("recon_export_batch_csv", || self.write_export(batch_id, output_path))
    }

    // ==========================================
    // 内部辅助
    // ==========================================

    fn write_export(&self, batch_id: &str, output_path: &str) -> ApiResult<ExportResponse> {
        if self.recon_repo.find_batch(batch_id)?.is_none() {
            return Err(ApiError::BatchNotFound(batch_id.to_string()));
        }
        let (outcomes, _) = self.recon_repo.list_outcomes(batch_id, None, None, 0)?;

        let export_err = |e: csv::Error| ApiError::InternalError(format!("导出写入失败: {}", e));
        let mut writer = csv::Writer::from_path(output_path).map_err(export_err)?;
        writer.write_record(EXPORT_HEADER).map_err(export_err)?;
        for outcome in &outcomes {
            let record = &outcome.external_record;
            writer
                .write_record([
                    batch_id.to_string(),
                    record.row_number.to_string(),
                    record.raw_serial_code.clone(),
                    record.identity_number.clone(),
                    record.ticketing_date.format("%Y-%m-%d").to_string(),
                    outcome.is_matched.to_string(),
                    outcome
                        .reason()
                        .map(|r| r.as_str().to_string())
                        .unwrap_or_default(),
                ])
                .map_err(export_err)?;
        }
        writer
            .flush()
            .map_err(|e| ApiError::InternalError(format!("导出写入失败: {}", e)))?;

        info!(batch_id = %batch_id, rows = outcomes.len(), path = %output_path, "批次已导出");
        Ok(ExportResponse {
            batch_id: batch_id.to_string(),
            file_path: output_path.to_string(),
            rows: outcomes.len(),
        })
    }

    /// 返回 (page, limit, offset)
    async fn normalize_paging(&self, page: u32, limit: u32) -> ApiResult<(u32, u32, u64)> {
        let max_limit = self.config.get_max_page_limit().await?;
        let page = page.max(1);
        let limit = limit.clamp(1, max_limit);
        let offset = u64::from(page - 1) * u64::from(limit);
        Ok((page, limit, offset))
    }

    fn enrich(&self, outcome: MatchOutcome) -> ApiResult<RecordView> {
        let fwc = match (&outcome.matched_card_id, outcome.is_matched) {
            (Some(card_id), true) => {
                let found = self
                    .reference_repo
                    .describe_match(card_id, outcome.matched_redeem_id.as_deref())?;
                if found.is_none() {
                    warn!(card_id = %card_id, "命中的卡已不存在");
                }
                found
            }
            _ => None,
        };
        Ok(RecordView { outcome, fwc })
    }
}
