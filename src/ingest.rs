//! Result ingestion: turn the scraper's CSV into typed rows.
//!
//! Text fields are kept verbatim. Numbers for `Price`, `Rooms` and `Size` are
//! derived from the first digit run in the text; a field with no number only
//! loses its derived value, never its row.

use crate::error::{IngestError, MalformedRecord};
use crate::model::{DerivedFields, ListingRow, ResultSet, SessionMeta};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Placeholder the scraper writes when a field could not be found on the page.
const NOT_AVAILABLE: &str = "N/A";

static NUMBER: OnceLock<Regex> = OnceLock::new();

fn number_pattern() -> &'static Regex {
    NUMBER.get_or_init(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("number pattern compiles"))
}

/// First run of digits (with thousands separators and an optional decimal part).
pub fn extract_number(text: &str) -> Option<f64> {
    let found = number_pattern().find(text)?;
    found.as_str().replace(',', "").parse().ok()
}

/// Read the scraper output at `output` and tag each row with `meta`.
pub fn ingest(output: &Path, meta: &SessionMeta) -> Result<ResultSet, IngestError> {
    if !output.exists() {
        return Err(IngestError::MissingOutput(output.to_path_buf()));
    }
    let csv_err = |source| IngestError::Csv {
        path: output.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(output)
        .map_err(csv_err)?;

    let columns: Vec<String> = reader
        .byte_headers()
        .map_err(csv_err)?
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let name = String::from_utf8_lossy(raw);
            // csv-writer style files may start with a BOM.
            let name = if i == 0 {
                name.trim_start_matches('\u{feff}')
            } else {
                &name
            };
            name.trim().to_string()
        })
        .collect();

    let mut rows = Vec::new();
    let mut issues = Vec::new();
    for (index, record) in reader.byte_records().enumerate() {
        let record = record.map_err(csv_err)?;
        let row_number = index + 1;

        let fields: BTreeMap<String, String> = record
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let key = columns
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("column_{}", i + 1));
                (key, String::from_utf8_lossy(raw).trim().to_string())
            })
            .collect();

        let mut derive = |column: &str| -> Option<f64> {
            let raw = fields.get(column)?;
            let value = extract_number(raw);
            if value.is_none() && !raw.is_empty() && raw != NOT_AVAILABLE {
                issues.push(MalformedRecord {
                    row: row_number,
                    field: column.to_string(),
                    raw: raw.clone(),
                });
            }
            value
        };
        let derived = DerivedFields {
            price: derive("Price"),
            rooms: derive("Rooms"),
            size: derive("Size"),
        };

        rows.push(ListingRow {
            fields,
            derived,
            timestamp_utc: meta.timestamp_utc.clone(),
            source_url: meta.url.clone(),
        });
    }

    for issue in &issues {
        debug!(%issue, "derived field missing");
    }
    info!(
        path = %output.display(),
        rows = rows.len(),
        issues = issues.len(),
        "results ingested"
    );

    Ok(ResultSet {
        meta: meta.clone(),
        columns,
        rows,
        issues,
    })
}
