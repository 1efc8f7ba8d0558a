// ==========================================
// FWC 对账引擎 - 表头定位器
// ==========================================
// 职责: 在报表顶部若干行内识别表头行及三个必需列
// 必需列: 证件号 (NIK/Passport No.) / 售票时间 (Ticketing Time) / 合作方卡号 (PlatTrade)
// ==========================================

use crate::importer::error::{ImportError, ImportResult};
use crate::importer::report_importer_trait::RawRow;
use serde::{Deserialize, Serialize};

pub const IDENTITY_COLUMN_LABEL: &str = "NIK/Passport No.";
pub const TICKETING_COLUMN_LABEL: &str = "Ticketing Time";
pub const SERIAL_COLUMN_LABEL: &str = "PlatTrade";

/// 列布局（0 起的行列下标）
///
/// 数据行从 header_row 的下一行开始
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnLayout {
    pub header_row: usize,
    pub identity_col: usize,
    pub ticketing_col: usize,
    pub serial_col: usize,
}

impl ColumnLayout {
    /// 第一个数据行的下标
    pub fn first_data_row(&self) -> usize {
        self.header_row + 1
    }
}

fn normalize_label(cell: &crate::domain::types::CellValue) -> String {
    cell.to_trimmed_string().to_lowercase()
}

fn is_identity_label(label: &str) -> bool {
    label == "nik"
        || label.contains("nik/passport")
        || (label.contains("nik") && label.contains("passport"))
}

fn is_ticketing_label(label: &str) -> bool {
    label.contains("ticketing time")
}

fn is_serial_label(label: &str) -> bool {
    label.contains("plattrade") || label.contains("plat trade")
}

fn find_col(row: &RawRow, pred: fn(&str) -> bool) -> Option<usize> {
    row.iter().position(|cell| pred(&normalize_label(cell)))
}

/// 定位表头行
///
/// # 参数
/// - rows: 文件全部原始行
/// - scan_rows: 从顶部扫描的最大行数
///
/// # 返回
/// - Ok(ColumnLayout): 证件号列所在行即表头行,其余两列须在同一行
/// - Err(MissingRequiredColumn): 任一必需列缺失
pub fn locate(rows: &[RawRow], scan_rows: usize) -> ImportResult<ColumnLayout> {
    let header = rows
        .iter()
        .take(scan_rows)
        .enumerate()
        .find_map(|(idx, row)| find_col(row, is_identity_label).map(|col| (idx, col)));

    let (header_row, identity_col) = header.ok_or_else(|| ImportError::MissingRequiredColumn {
        column: IDENTITY_COLUMN_LABEL.to_string(),
    })?;

    let row = &rows[header_row];
    let ticketing_col =
        find_col(row, is_ticketing_label).ok_or_else(|| ImportError::MissingRequiredColumn {
            column: TICKETING_COLUMN_LABEL.to_string(),
        })?;
    let serial_col =
        find_col(row, is_serial_label).ok_or_else(|| ImportError::MissingRequiredColumn {
            column: SERIAL_COLUMN_LABEL.to_string(),
        })?;

    Ok(ColumnLayout {
        header_row,
        identity_col,
        ticketing_col,
        serial_col,
    })
}
