// ==========================================
// FWC 对账引擎 - 报表导入 Trait
// ==========================================
// 职责: 定义报表导入接口（不包含实现）
// 管道: 文件解析 → 表头定位 → 行规范化 → 落库
// ==========================================

use crate::domain::reconciliation::{ExternalRecord, IngestSummary, RowRejection};
use crate::domain::types::CellValue;
use crate::importer::column_locator::ColumnLayout;
use crate::importer::error::ImportResult;
use async_trait::async_trait;
use std::path::Path;

/// 原始行: 列序号 → 单元格
pub type RawRow = Vec<CellValue>;

// ==========================================
// FileParser Trait
// ==========================================
// 用途: 文件解析接口（阶段 0）
// 实现者: ExcelParser, CsvParser
pub trait FileParser: Send + Sync {
    /// 解析文件为原始行（保留表头与空行,行序号 = 源文件绝对位置）
    ///
    /// # 返回
    /// - Ok(Vec<RawRow>): 第 i 个元素对应源文件第 i+1 行
    /// - Err: 文件读取错误、格式错误
    fn parse_to_rows(&self, file_path: &Path) -> ImportResult<Vec<RawRow>>;
}

// ==========================================
// RowNormalizer Trait
// ==========================================
// 用途: 单行规范化接口（阶段 2）
// 实现者: ReportRowNormalizer
pub trait RowNormalizer: Send + Sync {
    /// 将一行原始数据转为外部记录
    ///
    /// # 参数
    /// - row: 原始行
    /// - row_number: 源文件行号（1 起）
    /// - layout: 已定位的列布局
    fn normalize(&self, row: &RawRow, row_number: usize, layout: &ColumnLayout) -> NormalizedRow;
}

/// 单行规范化结果
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRow {
    /// 有效记录
    Record(ExternalRecord),
    /// 必需列全部为空: 静默跳过,不计数
    Blank,
    /// 行级拒绝: 不计入 total_rows,写入导入摘要
    Rejected(RowRejection),
}

// ==========================================
// ReportImporter Trait
// ==========================================
// 用途: 报表导入主接口
// 实现者: ReportImporterImpl
#[async_trait]
pub trait ReportImporter: Send + Sync {
    /// 导入单个报表文件,创建 PENDING 批次
    ///
    /// # 返回
    /// - Ok(IngestSummary): 新批次 + 行拒绝明细
    /// - Err(MissingRequiredColumn / NoUsableRows / 文件错误): 不创建批次
    async fn ingest_file(
        &self,
        file_path: &Path,
        operator: Option<&str>,
    ) -> ImportResult<IngestSummary>;

    /// 批量导入多个文件（并发执行,互不影响）
    async fn ingest_files(
        &self,
        file_paths: Vec<String>,
        operator: Option<&str>,
    ) -> Vec<Result<IngestSummary, String>>;
}
