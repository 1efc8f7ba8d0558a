// ==========================================
// FWC 对账引擎 - 导入层
// ==========================================
// 职责: 合作方报表导入,生成 PENDING 对账批次
// 支持: Excel (xlsx/xls), CSV
// ==========================================

// 模块声明
pub mod column_locator;
pub mod error;
pub mod file_parser;
pub mod report_importer;
pub mod report_importer_trait;
pub mod row_normalizer;

// 重导出核心类型
pub use column_locator::ColumnLayout;
pub use error::{ImportError, ImportResult};
pub use file_parser::{CsvParser, ExcelParser, UniversalFileParser};
pub use report_importer::ReportImporterImpl;
pub use row_normalizer::{
    parse_ticketing_date, ReportRowNormalizer, DEFAULT_IDENTITY_PREFIX, DEFAULT_SERIAL_PREFIX,
};

// 重导出 Trait 接口
pub use report_importer_trait::{
    FileParser, NormalizedRow, RawRow, ReportImporter, RowNormalizer,
};
