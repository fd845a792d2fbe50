use crate::error::{ConfigError, MalformedRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the CSV the scraper writes inside the session working directory.
pub const OUTPUT_FILE_NAME: &str = "listings.csv";
/// File name of the operator signal slot inside the session working directory.
pub const SIGNAL_FILE_NAME: &str = "signal.txt";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub session_id: String,
    pub url: String,
    pub scraper_path: PathBuf,
    #[serde(default)]
    pub interpreter: Option<String>,
    pub max_pages: u32,
    pub max_pages_cap: u32,
    pub work_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub cancel_notice: Duration,
}

impl RunConfig {
    /// Reject configurations that must never reach the launcher.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        if self.max_pages == 0 || self.max_pages > self.max_pages_cap {
            return Err(ConfigError::PageLimit {
                value: self.max_pages,
                cap: self.max_pages_cap,
            });
        }
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(OUTPUT_FILE_NAME)
    }

    pub fn signal_path(&self) -> PathBuf {
        self.work_dir.join(SIGNAL_FILE_NAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single line of scraper output means to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    CaptchaDetected,
    CaptchaResolved,
    ElementSelectionRequested,
    ElementSelected,
    PageStarted { page: u32 },
    PageAdvancing,
    ExtractionStarted,
    ScrapeCompleted { count: Option<u64> },
    DiagnosticEmitted,
    Unclassified,
}

/// One classified output line. Never mutated after classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeEvent {
    pub seq: u64,
    pub source: StreamSource,
    pub text: String,
    pub kind: EventKind,
}

/// Tokens the scraper understands in the signal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalToken {
    None,
    CaptchaSolved,
    ElementSelected,
}

impl SignalToken {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalToken::None => "none",
            SignalToken::CaptchaSolved => "captcha_solved",
            SignalToken::ElementSelected => "element_selected",
        }
    }
}

/// A pending operator hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Captcha,
    Element,
}

impl PromptKind {
    /// Token written to the signal file when the operator confirms this prompt.
    pub fn token(self) -> SignalToken {
        match self {
            PromptKind::Captcha => SignalToken::CaptchaSolved,
            PromptKind::Element => SignalToken::ElementSelected,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            PromptKind::Captcha => {
                "CAPTCHA detected! Solve it in the browser window, then press Enter (q to cancel)."
            }
            PromptKind::Element => {
                "Select a listing element in the browser window, then press Enter (q to cancel)."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Launch(String),
    StreamRead(String),
    Exit { code: Option<i32> },
    Supervision(String),
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Launch(msg) => write!(f, "launch failed: {msg}"),
            FailureReason::StreamRead(msg) => write!(f, "output stream failed: {msg}"),
            FailureReason::Exit { code: Some(code) } => {
                write!(f, "scraper exited with status {code}")
            }
            FailureReason::Exit { code: None } => f.write_str("scraper was terminated by a signal"),
            FailureReason::Supervision(msg) => write!(f, "lost track of scraper process: {msg}"),
            FailureReason::Cancelled => f.write_str("cancelled by operator"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Launching,
    Running,
    AwaitingCaptcha,
    AwaitingElement,
    Completed,
    Failed { reason: FailureReason },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed { .. })
    }

    /// The prompt the operator must answer in this state, if any.
    pub fn pending_prompt(&self) -> Option<PromptKind> {
        match self {
            SessionState::AwaitingCaptcha => Some(PromptKind::Captcha),
            SessionState::AwaitingElement => Some(PromptKind::Element),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            SessionState::Idle => "idle".into(),
            SessionState::Launching => "launching".into(),
            SessionState::Running => "running".into(),
            SessionState::AwaitingCaptcha => "awaiting CAPTCHA".into(),
            SessionState::AwaitingElement => "awaiting element selection".into(),
            SessionState::Completed => "completed".into(),
            SessionState::Failed { reason } => format!("failed ({reason})"),
        }
    }
}

/// Final JSON line printed by the scraper, e.g. `{"success":true,"path":"...","count":12}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScraperReport {
    pub success: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Mutable state of one run, owned by the session controller.
#[derive(Debug, Clone)]
pub struct ScrapeSession {
    pub config: RunConfig,
    pub state: SessionState,
    pub log: Vec<ScrapeEvent>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub pages_seen: Option<u32>,
    pub listings_reported: Option<u64>,
    pub completion_reported: bool,
    pub prompts_confirmed: u32,
    pub scraper_report: Option<ScraperReport>,
    pub cancel_requested: bool,
    pub started_utc: String,
}

impl ScrapeSession {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            log: Vec::new(),
            pid: None,
            exit_code: None,
            pages_seen: None,
            listings_reported: None,
            completion_reported: false,
            prompts_confirmed: 0,
            scraper_report: None,
            cancel_requested: false,
            started_utc: now_rfc3339(),
        }
    }
}

/// Metadata attached to every ingested row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub timestamp_utc: String,
    pub url: String,
}

/// Numbers derived from the text columns. `None` when the text holds no number.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub price: Option<f64>,
    pub rooms: Option<f64>,
    pub size: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRow {
    pub fields: BTreeMap<String, String>,
    pub derived: DerivedFields,
    pub timestamp_utc: String,
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub meta: SessionMeta,
    /// Header columns in file order.
    pub columns: Vec<String>,
    pub rows: Vec<ListingRow>,
    #[serde(default)]
    pub issues: Vec<MalformedRecord>,
}

/// What ingestion produced for a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Rows { results: ResultSet },
    NoOutput { path: PathBuf },
    Failed { reason: String },
}

impl IngestOutcome {
    pub fn results(&self) -> Option<&ResultSet> {
        match self {
            IngestOutcome::Rows { results } => Some(results),
            _ => None,
        }
    }
}

/// Immutable record of a finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub config: RunConfig,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub pages_seen: Option<u32>,
    pub listings_reported: Option<u64>,
    pub prompts_confirmed: u32,
    pub scraper_report: Option<ScraperReport>,
    pub results: Option<IngestOutcome>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    pub log: Vec<ScrapeEvent>,
    pub started_utc: String,
    pub finished_utc: String,
}

impl SessionReport {
    pub fn from_session(session: ScrapeSession) -> Self {
        Self {
            config: session.config,
            state: session.state,
            pid: session.pid,
            exit_code: session.exit_code,
            pages_seen: session.pages_seen,
            listings_reported: session.listings_reported,
            prompts_confirmed: session.prompts_confirmed,
            scraper_report: session.scraper_report,
            results: None,
            artifacts: Vec::new(),
            log: session.log,
            started_utc: session.started_utc,
            finished_utc: now_rfc3339(),
        }
    }

    /// Metadata stamped on ingested rows: the session's finish time and target URL.
    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            session_id: self.config.session_id.clone(),
            timestamp_utc: self.finished_utc.clone(),
            url: self.config.url.clone(),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.config.output_path()
    }

    pub fn work_dir(&self) -> &Path {
        &self.config.work_dir
    }

    pub fn lines_from(&self, source: StreamSource) -> usize {
        self.log.iter().filter(|ev| ev.source == source).count()
    }
}

/// Events emitted by the session controller and consumed by the CLI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Line(ScrapeEvent),
    Prompt(PromptKind),
    SignalWritten {
        token: SignalToken,
        path: PathBuf,
    },
    Info(InfoEvent),
}

/// Structured info events emitted by the controller and rendered by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoEvent {
    Launched { pid: Option<u32>, argv: Vec<String> },
    StreamClosed { source: StreamSource },
    CancelRequested,
    StillCancelling,
    SignalWriteFailed(String),
}

impl InfoEvent {
    /// Render a human-readable message for the CLI.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Launched { pid, argv } => match pid {
                Some(pid) => format!("Scraper started (pid {}): {}", pid, argv.join(" ")),
                None => format!("Scraper started: {}", argv.join(" ")),
            },
            InfoEvent::StreamClosed { source } => format!("Scraper {} closed", source),
            InfoEvent::CancelRequested => "Cancelling…".to_string(),
            InfoEvent::StillCancelling => "Still cancelling…".to_string(),
            InfoEvent::SignalWriteFailed(msg) => {
                format!("Could not write signal file ({msg}); press Enter to retry")
            }
        }
    }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_pages: u32) -> RunConfig {
        RunConfig {
            session_id: "abc".into(),
            url: "https://www.yad2.co.il/realestate/forsale".into(),
            scraper_path: PathBuf::from("interactive_scraper.js"),
            interpreter: Some("node".into()),
            max_pages,
            max_pages_cap: 20,
            work_dir: PathBuf::from("/tmp/session-abc"),
            cancel_notice: Duration::from_secs(3),
        }
    }

    #[test]
    fn page_limit_must_be_within_cap() {
        assert!(config(1).validate().is_ok());
        assert!(config(20).validate().is_ok());
        assert!(matches!(
            config(0).validate(),
            Err(ConfigError::PageLimit { value: 0, cap: 20 })
        ));
        assert!(matches!(
            config(21).validate(),
            Err(ConfigError::PageLimit { value: 21, cap: 20 })
        ));
    }

    #[test]
    fn blank_url_is_rejected() {
        let mut cfg = config(3);
        cfg.url = "  ".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyUrl)));
    }

    #[test]
    fn session_paths_live_in_work_dir() {
        let cfg = config(3);
        assert_eq!(cfg.output_path(), PathBuf::from("/tmp/session-abc/listings.csv"));
        assert_eq!(cfg.signal_path(), PathBuf::from("/tmp/session-abc/signal.txt"));
    }

    #[test]
    fn scraper_report_parses_partial_objects() {
        let report: ScraperReport =
            serde_json::from_str(r#"{"success":false,"error":"No listings found"}"#).unwrap();
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("No listings found"));
        assert_eq!(report.count, None);
    }

    #[test]
    fn failed_state_label_carries_reason() {
        let state = SessionState::Failed {
            reason: FailureReason::Exit { code: Some(2) },
        };
        assert!(state.is_terminal());
        assert_eq!(state.label(), "failed (scraper exited with status 2)");
        assert_eq!(
            SessionState::AwaitingElement.pending_prompt(),
            Some(PromptKind::Element)
        );
    }

    #[test]
    fn launch_message_omits_unknown_pid() {
        let argv = vec!["node".to_string(), "scraper.js".to_string()];
        let known = InfoEvent::Launched {
            pid: Some(42),
            argv: argv.clone(),
        };
        let unknown = InfoEvent::Launched { pid: None, argv };
        assert_eq!(known.to_message(), "Scraper started (pid 42): node scraper.js");
        assert_eq!(unknown.to_message(), "Scraper started: node scraper.js");
    }
}
