//! Text summary builder for CLI output.
//!
//! Formats a human-readable account of one finished session for text mode.

use crate::model::{IngestOutcome, SessionReport, StreamSource};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished session report.
pub(crate) fn build_text_summary(report: &SessionReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Session: {}", report.config.session_id));
    lines.push(format!("URL: {}", report.config.url));
    lines.push(format!("Status: {}", report.state.label()));
    if let Some(code) = report.exit_code {
        lines.push(format!("Exit code: {code}"));
    }

    let pages = report
        .pages_seen
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".into());
    lines.push(format!(
        "Pages: {} of {} max, operator hand-offs: {}",
        pages, report.config.max_pages, report.prompts_confirmed
    ));
    if let Some(count) = report.listings_reported {
        lines.push(format!("Listings reported by scraper: {count}"));
    }
    if let Some(err) = report
        .scraper_report
        .as_ref()
        .and_then(|r| r.error.as_deref())
    {
        lines.push(format!("Scraper error: {err}"));
    }

    match &report.results {
        Some(IngestOutcome::Rows { results }) => {
            lines.push(format!(
                "Rows ingested: {} ({} columns)",
                results.rows.len(),
                results.columns.len()
            ));
            if !results.issues.is_empty() {
                lines.push(format!(
                    "Fields without a numeric value: {}",
                    results.issues.len()
                ));
            }
        }
        Some(IngestOutcome::NoOutput { .. }) => {
            lines.push("No results found. The scraper may have failed.".into());
        }
        Some(IngestOutcome::Failed { reason }) => {
            lines.push(format!("Error reading results: {reason}"));
        }
        None => {}
    }

    if report.results.is_some() {
        lines.push(format!("Output: {}", report.output_path().display()));
    }
    for artifact in &report.artifacts {
        lines.push(format!("Screenshot: {}", artifact.display()));
    }
    lines.push(format!(
        "Log: {} stdout lines, {} stderr lines",
        report.lines_from(StreamSource::Stdout),
        report.lines_from(StreamSource::Stderr)
    ));

    TextSummary { lines }
}
