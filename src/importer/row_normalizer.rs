// ==========================================
// FWC 对账引擎 - 行规范化器
// ==========================================
// 职责: 原始行 → ExternalRecord,或给出行级拒绝原因
// 日期格式: YYYYMMDD / ISO 日期或日期时间 / DD/MM/YYYY / Excel 日期序列号
// ==========================================

use crate::domain::reconciliation::{ExternalRecord, RowRejection};
use crate::domain::types::{CellValue, RowRejectReason};
use crate::importer::column_locator::ColumnLayout;
use crate::importer::report_importer_trait::{NormalizedRow, RawRow, RowNormalizer};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};

/// 默认合作方卡号前缀
pub const DEFAULT_SERIAL_PREFIX: &str = "FWC-";

/// 默认合作方证件号前缀（大小写不敏感）
pub const DEFAULT_IDENTITY_PREFIX: &str = "FW";

// Excel 日期序列号有效范围 (1900-01-01 ~ 9999-12-31)
const EXCEL_SERIAL_MIN: f64 = 1.0;
const EXCEL_SERIAL_MAX: f64 = 2_958_465.0;

pub struct ReportRowNormalizer {
    serial_prefix: String,
    identity_prefix: String,
}

impl ReportRowNormalizer {
    pub fn new(serial_prefix: impl Into<String>) -> Self {
        Self {
            serial_prefix: serial_prefix.into(),
            identity_prefix: DEFAULT_IDENTITY_PREFIX.to_string(),
        }
    }

    /// 覆写证件号前缀（空字符串关闭剥离）
    pub fn with_identity_prefix(mut self, identity_prefix: impl Into<String>) -> Self {
        self.identity_prefix = identity_prefix.into();
        self
    }

    /// 清洗证件号: trim → 去除前缀（大小写不敏感,仅去一次）→ 再 trim
    ///
    /// # 示例
    /// - "FW3174096112900001" → "3174096112900001"
    /// - " fw 3174 " → "3174"
    pub fn clean_identity(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        let len = self.identity_prefix.len();
        if len == 0 {
            return trimmed.to_string();
        }
        match trimmed.get(..len) {
            Some(head) if head.eq_ignore_ascii_case(&self.identity_prefix) => {
                trimmed[len..].trim().to_string()
            }
            _ => trimmed.to_string(),
        }
    }

    /// 去除合作方前缀（大小写敏感,仅去一次）
    pub fn clean_serial(&self, raw: &str) -> String {
        if self.serial_prefix.is_empty() {
            return raw.to_string();
        }
        raw.strip_prefix(self.serial_prefix.as_str())
            .unwrap_or(raw)
            .to_string()
    }
}

impl Default for ReportRowNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_SERIAL_PREFIX)
    }
}

impl RowNormalizer for ReportRowNormalizer {
    fn normalize(&self, row: &RawRow, row_number: usize, layout: &ColumnLayout) -> NormalizedRow {
        let cell = |col: usize| row.get(col).unwrap_or(&CellValue::Empty);
        let identity_cell = cell(layout.identity_col);
        let ticketing_cell = cell(layout.ticketing_col);
        let serial_cell = cell(layout.serial_col);

        if identity_cell.is_blank() && ticketing_cell.is_blank() && serial_cell.is_blank() {
            return NormalizedRow::Blank;
        }

        let identity_number = self.clean_identity(&identity_cell.to_trimmed_string());
        if identity_number.is_empty() {
            return NormalizedRow::Rejected(RowRejection {
                row_number,
                reason: RowRejectReason::MissingIdentity,
                raw_value: None,
            });
        }

        let ticketing_date = match parse_ticketing_date(ticketing_cell) {
            Some(date) => date,
            None => {
                return NormalizedRow::Rejected(RowRejection {
                    row_number,
                    reason: RowRejectReason::InvalidDate,
                    raw_value: Some(ticketing_cell.to_trimmed_string()),
                })
            }
        };

        let raw_serial_code = serial_cell.to_trimmed_string();
        let cleaned_serial_code = self.clean_serial(&raw_serial_code);

        NormalizedRow::Record(ExternalRecord {
            row_number,
            identity_number,
            ticketing_date,
            raw_serial_code,
            cleaned_serial_code,
        })
    }
}

// ==========================================
// 日期解析
// ==========================================

/// 解析售票时间单元格,只保留日期部分
pub fn parse_ticketing_date(cell: &CellValue) -> Option<NaiveDate> {
    match cell {
        CellValue::Empty => None,
        CellValue::Number(n) => parse_numeric_date(*n),
        CellValue::Text(s) => parse_text_date(s.trim()),
    }
}

fn parse_numeric_date(n: f64) -> Option<NaiveDate> {
    if !n.is_finite() || n < 0.0 {
        return None;
    }

    // 8 位整数按 YYYYMMDD 处理
    if n.fract() == 0.0 && (10_000_101.0..=99_991_231.0).contains(&n) {
        return NaiveDate::parse_from_str(&format!("{}", n as i64), "%Y%m%d").ok();
    }

    if (EXCEL_SERIAL_MIN..=EXCEL_SERIAL_MAX).contains(&n) {
        return excel_serial_to_date(n);
    }
    None
}

/// Excel 日期序列号 → 日期（1900 日期系统）
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(Duration::days(serial.floor() as i64))
}

fn parse_text_date(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }

    // YYYYMMDD（可带时刻: "20260114 083000"）
    let compact = s.split_whitespace().next().unwrap_or(s);
    if compact.len() == 8 && compact.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::parse_from_str(compact, "%Y%m%d").ok();
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    // 其余 ISO 日期时间变体: 取前 10 位
    if let Some(prefix) = s.get(..10) {
        if s.len() > 10 {
            if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }

    // DD/MM/YYYY（可带时刻）
    NaiveDate::parse_from_str(compact, "%d/%m/%Y").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: ColumnLayout = ColumnLayout {
        header_row: 1,
        identity_col: 0,
        ticketing_col: 1,
        serial_col: 2,
    };

    fn text_row(identity: &str, ticketing: &str, serial: &str) -> RawRow {
        vec![
            CellValue::from(identity),
            CellValue::from(ticketing),
            CellValue::from(serial),
        ]
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_normalize_strips_partner_prefix() {
        let normalizer = ReportRowNormalizer::default();
        let row = text_row(" 3174052111110001 ", "20260114", "FWC-01252600033");

        match normalizer.normalize(&row, 3, &LAYOUT) {
            NormalizedRow::Record(record) => {
                assert_eq!(record.row_number, 3);
                assert_eq!(record.identity_number, "3174052111110001");
                assert_eq!(record.ticketing_date, ymd(2026, 1, 14));
                assert_eq!(record.raw_serial_code, "FWC-01252600033");
                assert_eq!(record.cleaned_serial_code, "01252600033");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_prefix_is_case_sensitive() {
        let normalizer = ReportRowNormalizer::default();
        assert_eq!(normalizer.clean_serial("fwc-0125"), "fwc-0125");
        assert_eq!(normalizer.clean_serial("0125"), "0125");
        assert_eq!(normalizer.clean_serial("FWC-FWC-0125"), "FWC-0125");
    }

    #[test]
    fn test_identity_prefix_is_stripped() {
        let normalizer = ReportRowNormalizer::default();
        assert_eq!(normalizer.clean_identity("FW3174096112900001"), "3174096112900001");
        assert_eq!(normalizer.clean_identity(" fw 3174 "), "3174");
        assert_eq!(normalizer.clean_identity("Fw3174"), "3174");
        // 只去一次,且仅限开头
        assert_eq!(normalizer.clean_identity("FWFW3174"), "FW3174");
        assert_eq!(normalizer.clean_identity("3174FW"), "3174FW");

        let row = text_row("FW3174096112900001", "20260114", "");
        let NormalizedRow::Record(record) = normalizer.normalize(&row, 3, &LAYOUT) else {
            panic!("expected record");
        };
        assert_eq!(record.identity_number, "3174096112900001");
    }

    #[test]
    fn test_identity_of_only_prefix_is_missing() {
        let normalizer = ReportRowNormalizer::default();
        let row = text_row(" fw ", "20260114", "FWC-01");

        match normalizer.normalize(&row, 6, &LAYOUT) {
            NormalizedRow::Rejected(rejection) => {
                assert_eq!(rejection.reason, RowRejectReason::MissingIdentity);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_identity_prefix_can_be_disabled() {
        let normalizer = ReportRowNormalizer::default().with_identity_prefix("");
        assert_eq!(normalizer.clean_identity(" FW3174 "), "FW3174");

        let custom = ReportRowNormalizer::default().with_identity_prefix("ID:");
        assert_eq!(custom.clean_identity("id: 3174"), "3174");
    }

    #[test]
    fn test_empty_serial_is_not_an_error() {
        let normalizer = ReportRowNormalizer::default();
        let row = text_row("3174", "2026-01-14", "");

        let NormalizedRow::Record(record) = normalizer.normalize(&row, 5, &LAYOUT) else {
            panic!("expected record");
        };
        assert!(!record.has_serial());
        assert_eq!(record.cleaned_serial_code, "");
    }

    #[test]
    fn test_missing_identity_rejected() {
        let normalizer = ReportRowNormalizer::default();
        let row = text_row("   ", "20260114", "FWC-01");

        assert_eq!(
            normalizer.normalize(&row, 7, &LAYOUT),
            NormalizedRow::Rejected(RowRejection {
                row_number: 7,
                reason: RowRejectReason::MissingIdentity,
                raw_value: None,
            })
        );
    }

    #[test]
    fn test_invalid_date_rejected() {
        let normalizer = ReportRowNormalizer::default();
        let row = text_row("3174", "yesterday", "");

        match normalizer.normalize(&row, 9, &LAYOUT) {
            NormalizedRow::Rejected(rejection) => {
                assert_eq!(rejection.reason, RowRejectReason::InvalidDate);
                assert_eq!(rejection.raw_value.as_deref(), Some("yesterday"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_blank_row_skipped() {
        let normalizer = ReportRowNormalizer::default();
        assert_eq!(
            normalizer.normalize(&text_row("", " ", ""), 4, &LAYOUT),
            NormalizedRow::Blank
        );
        // 行比布局短也视为空行
        assert_eq!(normalizer.normalize(&Vec::new(), 4, &LAYOUT), NormalizedRow::Blank);
    }

    #[test]
    fn test_parse_ticketing_date_formats() {
        let expected = ymd(2026, 1, 14);
        for text in [
            "20260114",
            "20260114 083015",
            "2026-01-14",
            "2026-01-14 08:30:15",
            "2026-01-14T08:30:15.250",
            "2026-01-14T08:30:15+07:00",
            "14/01/2026",
        ] {
            assert_eq!(
                parse_ticketing_date(&CellValue::Text(text.to_string())),
                Some(expected),
                "format: {}",
                text
            );
        }

        assert_eq!(parse_ticketing_date(&CellValue::Number(20260114.0)), Some(expected));
        // 2026-01-14 的 Excel 序列号为 46036（带时刻的小数部分被忽略）
        assert_eq!(parse_ticketing_date(&CellValue::Number(46036.35)), Some(expected));
    }

    #[test]
    fn test_parse_ticketing_date_rejects_garbage() {
        assert_eq!(parse_ticketing_date(&CellValue::Empty), None);
        assert_eq!(parse_ticketing_date(&CellValue::Text("20261341".to_string())), None);
        assert_eq!(parse_ticketing_date(&CellValue::Text("31/02/2026".to_string())), None);
        assert_eq!(parse_ticketing_date(&CellValue::Number(-3.0)), None);
    }
}
