use crate::engine::absolute_scraper_path;
use crate::model::{EventKind, IngestOutcome, RunConfig, SessionEvent, SessionReport, SessionState};
use crate::orchestrator::{self, OperatorCommand};
use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Read operator answers from stdin on a plain thread; stdin reads cannot be cancelled.
///
/// Any line confirms the pending prompt; `q`, `quit` or `cancel` cancels the run.
fn spawn_operator_input(tx: mpsc::UnboundedSender<OperatorCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let cmd = parse_operator_line(&line);
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("operator input closed");
    });
}

fn parse_operator_line(line: &str) -> OperatorCommand {
    match line.trim().to_ascii_lowercase().as_str() {
        "q" | "quit" | "cancel" => OperatorCommand::Cancel,
        _ => OperatorCommand::Confirm,
    }
}

/// Ctrl-C cancels the session instead of killing the orchestrator, so output is still drained.
fn spawn_interrupt_watcher(tx: mpsc::UnboundedSender<OperatorCommand>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(OperatorCommand::Cancel).is_err() {
                break;
            }
        }
    });
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "listings-scraper",
    version,
    about = "Run an interactive listings scraper and hand CAPTCHAs to a human operator"
)]
pub struct Cli {
    /// Listings search page to scrape
    #[arg(default_value = "https://www.yad2.co.il/realestate/forsale")]
    pub url: String,

    /// Scraper program or script
    #[arg(long)]
    pub scraper: PathBuf,

    /// Program that runs the scraper script (e.g. node); omit to execute the scraper directly
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Maximum pages to scrape
    #[arg(long, default_value_t = 3)]
    pub max_pages: u32,

    /// Upper bound accepted for --max-pages
    #[arg(long, default_value_t = 20)]
    pub max_pages_cap: u32,

    /// Directory for session files (default: per-user cache dir)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Print the session report as JSON
    #[arg(long)]
    pub json: bool,

    /// Print status changes and a text summary only (no scraper log)
    #[arg(long)]
    pub text: bool,

    /// Export ingested rows as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Warn when a cancel has not finished after this long
    #[arg(long, default_value = "3s")]
    pub cancel_notice: humantime::Duration,
}

pub async fn run(args: Cli) -> Result<()> {
    if args.json && args.text {
        return Err(anyhow::anyhow!(
            "--json and --text are exclusive. Pick one output mode."
        ));
    }
    let cfg = build_config(&args);
    cfg.validate().context("invalid configuration")?;

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<OperatorCommand>();
    spawn_operator_input(cmd_tx.clone());
    spawn_interrupt_watcher(cmd_tx);

    let session = tokio::spawn(orchestrator::run_session(cfg, evt_tx, cmd_rx));

    let show_log = !args.json && !args.text;
    while let Some(ev) = evt_rx.recv().await {
        if let Some(msg) = render_event(&ev, show_log) {
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
    }

    let report = session.await.context("session task failed")?;

    for msg in handle_exports(&args, &report)? {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }

    if args.json {
        let out = serde_json::to_string_pretty(&report)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in crate::text_summary::build_text_summary(&report).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;

    match report.state {
        SessionState::Failed { reason } => Err(anyhow::anyhow!(
            "session {} failed: {}",
            report.config.session_id,
            reason
        )),
        _ => Ok(()),
    }
}

/// Format a session event for the operator. `None` hides it.
fn render_event(ev: &SessionEvent, show_log: bool) -> Option<String> {
    match ev {
        SessionEvent::StateChanged { from, to } => {
            if from.pending_prompt().is_some() && *to == SessionState::Running {
                Some("== running (operator hand-off done) ==".into())
            } else {
                Some(format!("== {} ==", to.label()))
            }
        }
        SessionEvent::Line(line) if show_log => Some(match line.kind {
            EventKind::DiagnosticEmitted => format!("scraper! {}", line.text),
            _ => format!("scraper> {}", line.text),
        }),
        SessionEvent::Line(line) => match line.kind {
            EventKind::PageStarted { page } => Some(format!("Scraping page {page}...")),
            EventKind::PageAdvancing => Some("Moving to next page...".into()),
            EventKind::ExtractionStarted => Some("Extracting listings from the page...".into()),
            _ => None,
        },
        SessionEvent::Prompt(kind) => Some(format!(">>> {}", kind.message())),
        SessionEvent::SignalWritten { token, path } => Some(format!(
            "Signalled {} via {}",
            token.as_str(),
            path.display()
        )),
        SessionEvent::Info(info) => Some(info.to_message()),
    }
}

/// Generate a random session ID; it also names the session's working directory.
fn gen_session_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    let session_id = gen_session_id();
    let root = args.work_dir.clone().unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("listings-scraper")
    });
    RunConfig {
        url: args.url.trim().to_string(),
        scraper_path: absolute_scraper_path(&args.scraper),
        interpreter: args.interpreter.clone().filter(|s| !s.trim().is_empty()),
        max_pages: args.max_pages,
        max_pages_cap: args.max_pages_cap,
        work_dir: root.join(&session_id),
        cancel_notice: Duration::from(args.cancel_notice),
        session_id,
    }
}

/// Handle export operations. Returns messages for the operator.
fn handle_exports(args: &Cli, report: &SessionReport) -> Result<Vec<String>> {
    let mut messages = Vec::new();
    let Some(path) = args.export_json.as_deref() else {
        return Ok(messages);
    };
    match report.results.as_ref().and_then(IngestOutcome::results) {
        Some(results) => {
            let json = serde_json::to_vec_pretty(results)?;
            std::fs::write(path, json)
                .with_context(|| format!("failed to export results to {}", path.display()))?;
            messages.push(format!("Exported JSON: {}", path.display()));
        }
        None => messages.push("Nothing to export: no results were ingested".into()),
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PromptKind, ScrapeEvent, SignalToken, StreamSource};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_match_reference_behavior() {
        let args = parse(&["listings-scraper", "--scraper", "scraper.js"]);
        assert_eq!(args.url, "https://www.yad2.co.il/realestate/forsale");
        assert_eq!(args.max_pages, 3);
        assert_eq!(args.max_pages_cap, 20);
        assert_eq!(Duration::from(args.cancel_notice), Duration::from_secs(3));
        assert!(args.interpreter.is_none());
    }

    #[test]
    fn build_config_places_session_under_work_dir() {
        let args = parse(&[
            "listings-scraper",
            "https://www.yad2.co.il/realestate/rent",
            "--scraper",
            "/opt/scraper/interactive_scraper.js",
            "--interpreter",
            "node",
            "--max-pages",
            "5",
            "--work-dir",
            "/tmp/scrapes",
        ]);
        let cfg = build_config(&args);
        assert_eq!(cfg.session_id.len(), 16);
        assert_eq!(cfg.work_dir, PathBuf::from("/tmp/scrapes").join(&cfg.session_id));
        assert_eq!(cfg.interpreter.as_deref(), Some("node"));
        assert_eq!(cfg.max_pages, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sessions_never_share_paths() {
        let args = parse(&["listings-scraper", "--scraper", "s.js", "--work-dir", "/tmp/x"]);
        let a = build_config(&args);
        let b = build_config(&args);
        assert_ne!(a.signal_path(), b.signal_path());
        assert_ne!(a.output_path(), b.output_path());
    }

    #[test]
    fn page_limit_over_cap_fails_before_launch() {
        let args = parse(&["listings-scraper", "--scraper", "s.js", "--max-pages", "21"]);
        assert!(build_config(&args).validate().is_err());
    }

    #[test]
    fn operator_lines_map_to_commands() {
        assert_eq!(parse_operator_line("\n"), OperatorCommand::Confirm);
        assert_eq!(parse_operator_line("y\n"), OperatorCommand::Confirm);
        assert_eq!(parse_operator_line("Q\n"), OperatorCommand::Cancel);
        assert_eq!(parse_operator_line(" cancel "), OperatorCommand::Cancel);
    }

    #[test]
    fn quiet_mode_shows_progress_but_not_raw_lines() {
        let page = SessionEvent::Line(ScrapeEvent {
            seq: 0,
            source: StreamSource::Stdout,
            text: "Scraping page 2...".into(),
            kind: EventKind::PageStarted { page: 2 },
        });
        let chatter = SessionEvent::Line(ScrapeEvent {
            seq: 1,
            source: StreamSource::Stdout,
            text: "File check: \"none\"".into(),
            kind: EventKind::Unclassified,
        });
        assert_eq!(
            render_event(&page, false).as_deref(),
            Some("Scraping page 2...")
        );
        assert_eq!(render_event(&chatter, false), None);
        assert_eq!(
            render_event(&chatter, true).as_deref(),
            Some("scraper> File check: \"none\"")
        );
        assert!(render_event(&SessionEvent::Prompt(PromptKind::Captcha), false).is_some());
        assert_eq!(
            render_event(
                &SessionEvent::SignalWritten {
                    token: SignalToken::CaptchaSolved,
                    path: PathBuf::from("/tmp/s/signal.txt"),
                },
                false
            )
            .as_deref(),
            Some("Signalled captcha_solved via /tmp/s/signal.txt")
        );
    }
}
