// ==========================================
// FWC 对账引擎 - 报表导入器实现
// ==========================================
// 职责: 整合导入流程,从文件到 PENDING 批次
// 流程: 解析 → 表头定位 → 行规范化 → 落库
// 约束: 批次与外部记录在同一事务中写入; 失败时不创建批次
// ==========================================

use crate::config::ReconConfigReader;
use crate::domain::reconciliation::{
    ExternalRecord, IngestSummary, ReconciliationBatch, RowRejection,
};
use crate::importer::column_locator::{self, ColumnLayout};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::report_importer_trait::{
    FileParser, NormalizedRow, RawRow, ReportImporter, RowNormalizer,
};
use crate::importer::row_normalizer::ReportRowNormalizer;
use crate::perf;
use crate::repository::ReconciliationRepository;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 行规范化阶段的产出
#[derive(Debug, Default)]
struct NormalizedRows {
    records: Vec<ExternalRecord>,
    rejections: Vec<RowRejection>,
    blank_rows: usize,
}

// ==========================================
// ReportImporterImpl - 报表导入器实现
// ==========================================
pub struct ReportImporterImpl<C>
where
    C: ReconConfigReader,
{
    // 数据访问层
    recon_repo: Arc<ReconciliationRepository>,

    // 配置读取器
    config: Arc<C>,

    // 导入组件
    file_parser: Box<dyn FileParser>,
}

impl<C> ReportImporterImpl<C>
where
    C: ReconConfigReader,
{
    /// 创建新的 ReportImporter 实例
    ///
    /// # 参数
    /// - recon_repo: 对账批次仓储
    /// - config: 配置读取器
    /// - file_parser: 文件解析器
    pub fn new(
        recon_repo: Arc<ReconciliationRepository>,
        config: Arc<C>,
        file_parser: Box<dyn FileParser>,
    ) -> Self {
        Self {
            recon_repo,
            config,
            file_parser,
        }
    }

    /// 从已解析的原始行导入（表头由定位器自动识别）
    ///
    /// # 参数
    /// - source_file_name: 批次记录的源文件名
    /// - rows: 全部原始行（含表头）
    /// - operator: 导入操作员
    pub async fn ingest_rows(
        &self,
        source_file_name: &str,
        rows: Vec<RawRow>,
        operator: Option<&str>,
    ) -> ImportResult<IngestSummary> {
        let scan_rows = self.config.get_header_scan_rows().await.map_err(config_err)?;
        let layout = column_locator::locate(&rows, scan_rows)?;
        debug!(?layout, "表头定位完成");

        self.ingest_with_layout(source_file_name, rows, layout, operator)
            .await
    }

    /// 按给定列布局导入
    pub async fn ingest_with_layout(
        &self,
        source_file_name: &str,
        rows: Vec<RawRow>,
        layout: ColumnLayout,
        operator: Option<&str>,
    ) -> ImportResult<IngestSummary> {
        let serial_prefix = self
            .config
            .get_partner_serial_prefix()
            .await
            .map_err(config_err)?;
        let identity_prefix = self
            .config
            .get_partner_identity_prefix()
            .await
            .map_err(config_err)?;
        let normalizer =
            ReportRowNormalizer::new(serial_prefix).with_identity_prefix(identity_prefix);

        perf::measure("recon_ingest_rows", || {
            self.normalize_and_persist(&normalizer, source_file_name, &rows, &layout, operator)
        })
    }

    /// 行规范化 + 落库（同步,不跨越 await）
    fn normalize_and_persist(
        &self,
        normalizer: &dyn RowNormalizer,
        source_file_name: &str,
        rows: &[RawRow],
        layout: &ColumnLayout,
        operator: Option<&str>,
    ) -> ImportResult<IngestSummary> {
        // === 行规范化 ===
        let scanned_rows = rows.len().saturating_sub(layout.first_data_row());
        let normalized = normalize_rows(normalizer, rows, layout);
        info!(
            scanned = scanned_rows,
            usable = normalized.records.len(),
            rejected = normalized.rejections.len(),
            blank = normalized.blank_rows,
            "行规范化完成"
        );

        if normalized.records.is_empty() {
            return Err(ImportError::NoUsableRows {
                scanned_rows,
                rejected_rows: normalized.rejections.len(),
            });
        }

        // === 落库 ===
        let batch = ReconciliationBatch::new_pending(
            Uuid::new_v4().to_string(),
            source_file_name.to_string(),
            normalized.records.len() as i64,
            normalized.rejections.len() as i64,
            operator.map(str::to_string),
        );
        self.recon_repo.insert_batch_with_records(
            &batch,
            &normalized.records,
            &normalized.rejections,
        )?;

        Ok(IngestSummary {
            batch,
            rejections: normalized.rejections,
            skipped_blank_rows: normalized.blank_rows,
        })
    }
}

fn config_err(e: crate::config::ConfigError) -> ImportError {
    ImportError::InternalError(format!("配置读取失败: {}", e))
}

fn normalize_rows(
    normalizer: &dyn RowNormalizer,
    rows: &[RawRow],
    layout: &ColumnLayout,
) -> NormalizedRows {
    let mut out = NormalizedRows::default();

    for (idx, row) in rows.iter().enumerate().skip(layout.first_data_row()) {
        let row_number = idx + 1;
        match normalizer.normalize(row, row_number, layout) {
            NormalizedRow::Record(record) => out.records.push(record),
            NormalizedRow::Blank => out.blank_rows += 1,
            NormalizedRow::Rejected(rejection) => {
                warn!(
                    row_number = rejection.row_number,
                    reason = %rejection.reason,
                    raw_value = ?rejection.raw_value,
                    "行被拒绝"
                );
                out.rejections.push(rejection);
            }
        }
    }
    out
}

#[async_trait]
impl<C> ReportImporter for ReportImporterImpl<C>
where
    C: ReconConfigReader + Send + Sync,
{
    /// 导入单个报表文件
    #[instrument(skip(self, file_path), fields(file = %file_path.display()))]
    async fn ingest_file(
        &self,
        file_path: &Path,
        operator: Option<&str>,
    ) -> ImportResult<IngestSummary> {
        let start_time = Instant::now();
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        info!(file_name = %file_name, "开始导入对账报表");

        // === 解析文件 ===
        let rows = perf::measure("recon_parse_file", || self.file_parser.parse_to_rows(file_path))
            .map_err(|e| {
                error!(error = %e, "文件解析失败");
                e
            })?;
        debug!(rows = rows.len(), "文件解析完成");

        let summary = self.ingest_rows(&file_name, rows, operator).await?;

        info!(
            batch_id = %summary.batch.batch_id,
            total_rows = summary.batch.total_rows,
            rejected_rows = summary.batch.rejected_rows,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "对账报表导入完成"
        );
        Ok(summary)
    }

    /// 批量导入多个文件（并发执行）
    async fn ingest_files(
        &self,
        file_paths: Vec<String>,
        operator: Option<&str>,
    ) -> Vec<Result<IngestSummary, String>> {
        use futures::future::join_all;

        info!(count = file_paths.len(), "开始批量导入报表");

        let tasks = file_paths.into_iter().map(|path| async move {
            match self.ingest_file(Path::new(&path), operator).await {
                Ok(summary) => Ok(summary),
                Err(e) => {
                    error!(file = %path, error = %e, "报表导入失败");
                    Err(format!("文件 {} 导入失败: {}", path, e))
                }
            }
        });

        let results = join_all(tasks).await;

        info!(
            total = results.len(),
            success = results.iter().filter(|r| r.is_ok()).count(),
            failed = results.iter().filter(|r| r.is_err()).count(),
            "批量导入完成"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigManager;
    use crate::domain::types::{BatchStatus, CellValue, RowRejectReason};
    use crate::importer::file_parser::UniversalFileParser;
    use rusqlite::Connection;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::Builder;

    fn importer() -> (ReportImporterImpl<ConfigManager>, Arc<ReconciliationRepository>) {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let repo = Arc::new(ReconciliationRepository::new(conn.clone()).unwrap());
        let config = Arc::new(ConfigManager::from_connection(conn).unwrap());
        (
            ReportImporterImpl::new(repo.clone(), config, Box::new(UniversalFileParser)),
            repo,
        )
    }

    fn row(cells: &[&str]) -> RawRow {
        cells.iter().map(|c| CellValue::from(*c)).collect()
    }

    fn header() -> Vec<RawRow> {
        vec![
            row(&["Whoosh Report"]),
            row(&["No", "NIK/Passport No.", "Ticketing Time", "PlatTrade"]),
        ]
    }

    #[tokio::test]
    async fn test_ingest_rows_counts_usable_rows_only() {
        let (importer, repo) = importer();
        let mut rows = header();
        rows.push(row(&["1", "3174", "20260114", "FWC-0125"]));
        rows.push(row(&["", "", "", ""]));
        rows.push(row(&["3", "", "20260114", "FWC-0126"]));
        rows.push(row(&["4", "5555", "not a date", ""]));
        rows.push(row(&["5", "7777", "2026-01-15", ""]));

        let summary = importer.ingest_rows("r.csv", rows, Some("admin")).await.unwrap();

        assert_eq!(summary.batch.status, BatchStatus::Pending);
        assert_eq!(summary.batch.total_rows, 2);
        assert_eq!(summary.batch.rejected_rows, 2);
        assert_eq!(summary.skipped_blank_rows, 1);
        assert_eq!(summary.rejections[0].row_number, 5);
        assert_eq!(summary.rejections[0].reason, RowRejectReason::MissingIdentity);
        assert_eq!(summary.rejections[1].reason, RowRejectReason::InvalidDate);

        let records = repo.load_external_records(&summary.batch.batch_id).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].row_number, 3);
        assert_eq!(records[0].cleaned_serial_code, "0125");
        assert_eq!(records[1].row_number, 7);
    }

    #[tokio::test]
    async fn test_no_usable_rows_creates_no_batch() {
        let (importer, repo) = importer();
        let mut rows = header();
        rows.push(row(&["1", "", "20260114", ""]));

        let err = importer.ingest_rows("r.csv", rows, None).await.unwrap_err();
        assert!(matches!(
            err,
            ImportError::NoUsableRows {
                scanned_rows: 1,
                rejected_rows: 1
            }
        ));
        assert_eq!(repo.list_batches(None, 10, 0).unwrap().1, 0);
    }

    #[tokio::test]
    async fn test_ingest_file_from_csv() {
        let (importer, _repo) = importer();
        let mut file = Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "Whoosh Report,,,").unwrap();
        writeln!(file, "No,NIK/Passport No.,Ticketing Time,PlatTrade").unwrap();
        writeln!(file, "1,3174,20260114,FWC-0125").unwrap();

        let summary = importer.ingest_file(file.path(), None).await.unwrap();
        assert_eq!(summary.batch.total_rows, 1);
        assert!(summary.batch.source_file_name.ends_with(".csv"));
    }

    #[tokio::test]
    async fn test_ingest_files_isolates_failures() {
        let (importer, _repo) = importer();
        let mut good = Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(good, "NIK,Ticketing Time,PlatTrade").unwrap();
        writeln!(good, "3174,20260114,").unwrap();

        let results = importer
            .ingest_files(
                vec![
                    good.path().to_string_lossy().to_string(),
                    "/nonexistent/report.csv".to_string(),
                ],
                None,
            )
            .await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
