use csv::ReaderBuilder;
use std::io::Read;
use std::path::Path;

use crate::error::EtlError;
use crate::models::{Relation, Value};

#[derive(Debug, Clone, Copy)]
pub struct CsvOptions {
    /// Drop a leading unnamed column (a row index written by the exporter)
    pub skip_index_column: bool,
    pub delimiter: u8,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            skip_index_column: true,
            delimiter: b',',
        }
    }
}

/// Read a headered CSV file into a relation of text cells. Typing is left
/// to the transforms; empty cells become nulls.
pub fn read_csv<P: AsRef<Path>>(path: P, options: CsvOptions) -> Result<Relation, EtlError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| EtlError::Extraction(format!("Failed to open {}: {}", path.display(), e)))?;

    let relation = read_csv_from(file, options)?;
    tracing::info!(
        "Extracted {} rows x {} columns from {}",
        relation.len(),
        relation.columns().len(),
        path.display()
    );
    Ok(relation)
}

pub fn read_csv_from<R: Read>(reader: R, options: CsvOptions) -> Result<Relation, EtlError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let skip = usize::from(options.skip_index_column && headers.first().is_some_and(|h| is_index_header(h)));
    let columns: Vec<String> = headers.into_iter().skip(skip).collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let values: Vec<Value> = record
            .iter()
            .skip(skip)
            .map(|cell| if cell.is_empty() { Value::Null } else { Value::text(cell) })
            .collect();

        if values.len() != columns.len() {
            return Err(EtlError::Extraction(format!(
                "Record {} has {} fields, expected {}",
                line + 1,
                values.len(),
                columns.len()
            )));
        }
        rows.push(values);
    }

    Relation::new(columns, rows)
}

fn is_index_header(header: &str) -> bool {
    header.is_empty() || header.starts_with("Unnamed:")
}
