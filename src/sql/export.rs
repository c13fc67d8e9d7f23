use super::value::{sniff_canonical_number, DbRow, DbValue};
use crate::error::AppResult;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Statements that replace a query so its rows are spooled to a stream file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvWrap {
    pub statements: Vec<String>,
    pub output_file: String,
}

/// Export wrapper used by the CSV side channel
pub trait CsvExport: Send + Sync {
    fn wrap(&self, statement: &str) -> AppResult<CsvWrap>;
}

/// Parse a spooled result set. The first record names the columns; a field
/// holding a single space is an empty string.
pub fn parse_csv(content: &[u8]) -> AppResult<Vec<DbRow>> {
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content);

    let headers = reader.headers()?.clone();
    let mut rows = vec![];

    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }

        let row: DbRow = headers
            .iter()
            .zip(record.iter())
            .map(|(name, field)| (name.to_string(), csv_value(field)))
            .collect();
        rows.push(row);
    }

    Ok(rows)
}

fn csv_value(field: &str) -> DbValue {
    if field == " " {
        return DbValue::Text(String::new());
    }
    match sniff_canonical_number(field) {
        Some(number) => DbValue::Number(number),
        None => DbValue::Text(field.to_string()),
    }
}
