//! Post-run processing utilities.
//!
//! Handles result ingestion and debug artifact collection after the scraper exits.

use crate::error::IngestError;
use crate::ingest;
use crate::model::{IngestOutcome, SessionReport};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Screenshot name prefixes the scraper writes next to its output.
const ARTIFACT_PREFIXES: &[&str] = &["page_loaded", "captcha", "after_captcha", "selected_element"];

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub results: IngestOutcome,
    pub artifacts: Vec<PathBuf>,
}

/// Process a finished run: ingest the output file and collect screenshots.
pub(crate) fn process_run_completion(report: &SessionReport) -> ProcessedRun {
    let output = report.output_path();
    let meta = report.meta();

    let results = match ingest::ingest(&output, &meta) {
        Ok(results) => IngestOutcome::Rows { results },
        Err(IngestError::MissingOutput(path)) => {
            warn!(path = %path.display(), "no results found; scraper produced no output file");
            IngestOutcome::NoOutput { path }
        }
        Err(e) => {
            warn!(error = %e, "result ingestion failed");
            IngestOutcome::Failed {
                reason: e.to_string(),
            }
        }
    };

    let artifacts = collect_artifacts(output.parent().unwrap_or(report.work_dir()));

    ProcessedRun { results, artifacts }
}

/// PNG screenshots with a known prefix, sorted by name.
fn collect_artifacts(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "artifact scan skipped");
            return Vec::new();
        }
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                return false;
            };
            name.ends_with(".png") && ARTIFACT_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .collect();
    found.sort();
    found
}
