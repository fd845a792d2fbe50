//! Line classification for scraper output.
//!
//! The scraper speaks free-form log text. The table below is the whole
//! contract: markers are checked in order and the first hit decides the kind.
//! Anything unmatched on stdout is `Unclassified`; every stderr line is a
//! diagnostic.

use crate::model::{EventKind, StreamSource};

#[derive(Debug, Clone, Copy)]
enum Marker {
    CaptchaDetected,
    CaptchaResolved,
    ElementSelectionRequested,
    ElementSelected,
    PageStarted,
    PageAdvancing,
    ExtractionStarted,
    ScrapeCompleted,
}

/// Markers in priority order. A rule matches when the line contains every needle.
const PATTERN_TABLE: &[(Marker, &[&str])] = &[
    (Marker::CaptchaDetected, &["CAPTCHA detected"]),
    (Marker::CaptchaResolved, &["Captcha solved successfully"]),
    (
        Marker::ElementSelectionRequested,
        &["INTERACTIVE ELEMENT SELECTION"],
    ),
    (Marker::ElementSelected, &["Selected element information:"]),
    (Marker::PageStarted, &["Scraping page"]),
    (Marker::PageAdvancing, &["Next page found"]),
    (Marker::ExtractionStarted, &["Extracting listings"]),
    (Marker::ScrapeCompleted, &["Successfully scraped", "listings"]),
];

/// Classify one line. Total: every input yields exactly one kind.
pub fn classify(source: StreamSource, line: &str) -> EventKind {
    if source == StreamSource::Stderr {
        return EventKind::DiagnosticEmitted;
    }

    let hit = PATTERN_TABLE
        .iter()
        .find(|(_, needles)| needles.iter().all(|n| line.contains(n)));

    match hit {
        None => EventKind::Unclassified,
        Some((marker, _)) => match marker {
            Marker::CaptchaDetected => EventKind::CaptchaDetected,
            Marker::CaptchaResolved => EventKind::CaptchaResolved,
            Marker::ElementSelectionRequested => EventKind::ElementSelectionRequested,
            Marker::ElementSelected => EventKind::ElementSelected,
            // An unreadable page number demotes the line instead of failing it.
            Marker::PageStarted => parse_page(line)
                .map(|page| EventKind::PageStarted { page })
                .unwrap_or(EventKind::Unclassified),
            Marker::PageAdvancing => EventKind::PageAdvancing,
            Marker::ExtractionStarted => EventKind::ExtractionStarted,
            Marker::ScrapeCompleted => EventKind::ScrapeCompleted {
                count: parse_between(line, "Successfully scraped", "listings"),
            },
        },
    }
}

/// Page number is the text between "page" and "..." in "Scraping page 2...".
fn parse_page(line: &str) -> Option<u32> {
    let start = line.find("Scraping page")? + "Scraping ".len();
    parse_between(&line[start..], "page", "...")
}

fn parse_between<T: std::str::FromStr>(line: &str, open: &str, close: &str) -> Option<T> {
    let rest = &line[line.find(open)? + open.len()..];
    let inner = match rest.find(close) {
        Some(end) => &rest[..end],
        None => rest,
    };
    inner.trim().parse().ok()
}
