//! Session lifecycle controller.
//!
//! Owns the session state machine, is the only writer of the signal slot, and
//! emits events for the CLI. Operator prompts have no timeout: a session stays
//! in `AwaitingCaptcha`/`AwaitingElement` until the operator confirms or cancels,
//! mirroring the scraper, which blocks on the signal file.

use super::post_process::process_run_completion;
use crate::engine::{self, EventStream, LaunchSpec, ProcessHandle, SignalChannel, StreamUpdate};
use crate::error::{LaunchError, StreamReadError};
use crate::model::{
    EventKind, FailureReason, InfoEvent, PromptKind, RunConfig, ScrapeEvent, ScrapeSession,
    ScraperReport, SessionEvent, SessionReport, SessionState, StreamSource,
};
use std::process::ExitStatus;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long to keep reading after the scraper exited while a descendant
/// (typically the browser) still holds its output pipes.
const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Commands sent by the operator-facing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperatorCommand {
    /// Confirm whatever prompt is pending. No-op when nothing is pending.
    Confirm,
    Cancel,
}

/// A launched scraper with its output already attached to an event stream.
pub(crate) struct RunningProcess {
    pub handle: ProcessHandle,
    pub stream: EventStream,
}

pub(crate) struct SessionController {
    session: ScrapeSession,
    signal: Option<SignalChannel>,
    event_tx: UnboundedSender<SessionEvent>,
}

impl SessionController {
    pub fn new(config: RunConfig, event_tx: UnboundedSender<SessionEvent>) -> Self {
        Self {
            session: ScrapeSession::new(config),
            signal: None,
            event_tx,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.session.state
    }

    fn emit(&self, ev: SessionEvent) {
        let _ = self.event_tx.send(ev);
    }

    fn transition(&mut self, to: SessionState) {
        if self.session.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.session.state, to.clone());
        info!(
            session = %self.session.config.session_id,
            from = %from.label(),
            to = %to.label(),
            "session state changed"
        );
        self.emit(SessionEvent::StateChanged {
            from,
            to: to.clone(),
        });
        if let Some(prompt) = to.pending_prompt() {
            self.emit(SessionEvent::Prompt(prompt));
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        if self.session.state.is_terminal() {
            debug!(%reason, "ignoring failure after terminal state");
            return;
        }
        warn!(session = %self.session.config.session_id, %reason, "session failed");
        self.transition(SessionState::Failed { reason });
    }

    /// `Idle -> Launching -> Running`, or `Failed` if the scraper cannot be started.
    ///
    /// The signal slot is created before the scraper is spawned so its path is
    /// valid from the scraper's first instruction.
    pub fn start(&mut self) -> Option<RunningProcess> {
        if self.session.state != SessionState::Idle {
            warn!(state = %self.session.state.label(), "start ignored; session already started");
            return None;
        }
        self.transition(SessionState::Launching);

        match self.launch() {
            Ok(mut handle) => {
                let (stdout, stderr) = match handle.take_pipes() {
                    Ok(pipes) => pipes,
                    Err(e) => {
                        self.fail(FailureReason::Launch(e.to_string()));
                        return None;
                    }
                };
                self.session.pid = handle.pid();
                self.emit(SessionEvent::Info(InfoEvent::Launched {
                    pid: handle.pid(),
                    argv: handle.argv().to_vec(),
                }));
                self.transition(SessionState::Running);
                Some(RunningProcess {
                    handle,
                    stream: EventStream::spawn(stdout, stderr),
                })
            }
            Err(e) => {
                self.fail(FailureReason::Launch(e.to_string()));
                None
            }
        }
    }

    fn launch(&mut self) -> Result<ProcessHandle, LaunchError> {
        let cfg = &self.session.config;
        std::fs::create_dir_all(&cfg.work_dir).map_err(|source| LaunchError::Prepare {
            path: cfg.work_dir.clone(),
            source,
        })?;
        let signal = SignalChannel::open(cfg.signal_path())?;
        let output = cfg.output_path();

        let handle = engine::launch(&LaunchSpec {
            scraper: &cfg.scraper_path,
            interpreter: cfg.interpreter.as_deref(),
            url: &cfg.url,
            output: &output,
            signal: signal.path(),
            max_pages: cfg.max_pages,
            cwd: &cfg.work_dir,
        })?;
        self.signal = Some(signal);
        Ok(handle)
    }

    /// Apply one classified output line.
    pub fn observe(&mut self, event: ScrapeEvent) {
        self.emit(SessionEvent::Line(event.clone()));
        let kind = event.kind;
        if kind == EventKind::Unclassified {
            self.capture_report(&event.text);
        }
        self.session.log.push(event);

        if self.session.state.is_terminal() {
            return;
        }
        let prompting = matches!(
            self.session.state,
            SessionState::Running | SessionState::AwaitingCaptcha | SessionState::AwaitingElement
        );

        match kind {
            EventKind::CaptchaDetected if prompting => {
                self.transition(SessionState::AwaitingCaptcha);
            }
            EventKind::ElementSelectionRequested if prompting => {
                self.transition(SessionState::AwaitingElement);
            }
            EventKind::CaptchaResolved | EventKind::ElementSelected if prompting => {
                // The scraper moved on; any prompt still showing is stale.
                self.transition(SessionState::Running);
            }
            EventKind::PageStarted { page } => {
                self.session.pages_seen = Some(self.session.pages_seen.map_or(page, |p| p.max(page)));
            }
            EventKind::ScrapeCompleted { count } => {
                self.session.completion_reported = true;
                if count.is_some() {
                    self.session.listings_reported = count;
                }
            }
            _ => {}
        }
    }

    fn capture_report(&mut self, text: &str) {
        let text = text.trim();
        if !text.starts_with('{') {
            return;
        }
        if let Ok(report) = serde_json::from_str::<ScraperReport>(text) {
            debug!(?report, "scraper report captured");
            if report.count.is_some() && self.session.listings_reported.is_none() {
                self.session.listings_reported = report.count;
            }
            self.session.scraper_report = Some(report);
        }
    }

    /// Operator confirmed the pending prompt. Writes the matching token once and
    /// returns to `Running`; without a pending prompt nothing is written.
    pub fn confirm(&mut self) -> Option<PromptKind> {
        let prompt = self.session.state.pending_prompt()?;
        let Some(signal) = self.signal.as_ref() else {
            warn!("confirm without a signal slot");
            return None;
        };

        let token = prompt.token();
        match signal.write_signal(token) {
            Ok(()) => {
                let path = signal.path().to_path_buf();
                info!(token = token.as_str(), path = %path.display(), "operator confirmed");
                self.session.prompts_confirmed += 1;
                self.emit(SessionEvent::SignalWritten { token, path });
                self.transition(SessionState::Running);
                Some(prompt)
            }
            Err(e) => {
                // Stay in the prompt; the operator can confirm again.
                warn!(error = %e, "signal write failed");
                self.emit(SessionEvent::Info(InfoEvent::SignalWriteFailed(e.to_string())));
                None
            }
        }
    }

    /// Best-effort kill; the session is declared failed once the exit is observed.
    ///
    /// Callers only cancel while the child's exit is still pending. A session that
    /// already failed (e.g. on a read error) still gets its scraper killed, and
    /// keeps its original failure reason.
    pub fn request_cancel(&mut self, handle: &mut ProcessHandle) {
        if self.session.cancel_requested {
            return;
        }
        self.session.cancel_requested = true;
        self.emit(SessionEvent::Info(InfoEvent::CancelRequested));
        handle.terminate();
    }

    pub fn stream_closed(&mut self, source: StreamSource) {
        debug!(stream = %source, "scraper stream closed");
        self.emit(SessionEvent::Info(InfoEvent::StreamClosed { source }));
    }

    pub fn stream_failed(&mut self, err: StreamReadError) {
        self.fail(FailureReason::StreamRead(err.to_string()));
    }

    /// Exit status is authoritative: zero, or an earlier completion report, means
    /// `Completed`; anything else fails the session unless it already ended.
    pub fn observe_exit(&mut self, status: std::io::Result<ExitStatus>) {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                self.fail(FailureReason::Supervision(e.to_string()));
                return;
            }
        };
        self.session.exit_code = status.code();
        info!(
            session = %self.session.config.session_id,
            code = ?status.code(),
            "scraper exited"
        );

        if self.session.state.is_terminal() {
            return;
        }
        if self.session.cancel_requested {
            self.fail(FailureReason::Cancelled);
        } else if status.success() || self.session.completion_reported {
            self.transition(SessionState::Completed);
        } else {
            self.fail(FailureReason::Exit {
                code: status.code(),
            });
        }
    }

    pub fn into_report(self) -> SessionReport {
        SessionReport::from_session(self.session)
    }
}

/// Drive one session from launch to a terminal state, then ingest its results.
pub(crate) async fn run_session(
    cfg: RunConfig,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<OperatorCommand>,
) -> SessionReport {
    let cancel_notice = cfg.cancel_notice;
    let mut controller = SessionController::new(cfg, event_tx.clone());
    let mut ran = false;

    if let Some(RunningProcess {
        mut handle,
        mut stream,
    }) = controller.start()
    {
        ran = true;
        let mut streams_open = true;
        let mut commands_open = true;
        let mut exit: Option<std::io::Result<ExitStatus>> = None;
        let mut drain_deadline: Option<Instant> = None;
        // Cancel watchdog: if a cancel takes too long, keep the operator informed.
        let mut cancel_deadline: Option<Instant> = None;
        let mut watchdog = tokio::time::interval(Duration::from_millis(500));

        while streams_open || exit.is_none() {
            tokio::select! {
                cmd = cmd_rx.recv(), if commands_open => {
                    match cmd {
                        Some(OperatorCommand::Confirm) => {
                            controller.confirm();
                        }
                        Some(OperatorCommand::Cancel) => {
                            if exit.is_none() {
                                controller.request_cancel(&mut handle);
                                cancel_deadline = Some(Instant::now() + cancel_notice);
                            }
                        }
                        // The operator side went away; prompts keep waiting regardless.
                        None => commands_open = false,
                    }
                }
                update = stream.next(), if streams_open => {
                    match update {
                        Some(StreamUpdate::Event(ev)) => controller.observe(ev),
                        Some(StreamUpdate::Closed(source)) => controller.stream_closed(source),
                        Some(StreamUpdate::Failed(err)) => controller.stream_failed(err),
                        None => streams_open = false,
                    }
                }
                status = handle.wait(), if exit.is_none() => {
                    debug!(?status, "scraper wait returned");
                    exit = Some(status);
                    cancel_deadline = None;
                    drain_deadline = Some(Instant::now() + STREAM_DRAIN_GRACE);
                }
                _ = async {
                    match drain_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => futures::future::pending().await,
                    }
                }, if streams_open => {
                    warn!("scraper exited but its output is still open; abandoning remaining output");
                    stream.abandon();
                    streams_open = false;
                }
                _ = watchdog.tick() => {
                    if let Some(deadline) = cancel_deadline {
                        if Instant::now() >= deadline {
                            let _ = event_tx.send(SessionEvent::Info(InfoEvent::StillCancelling));
                            cancel_deadline = None;
                        }
                    }
                }
            }
        }

        if let Some(status) = exit {
            controller.observe_exit(status);
        }
        debug!(state = %controller.state().label(), "session loop finished");
    }

    let mut report = controller.into_report();
    if ran {
        let processed = process_run_completion(&report);
        report.results = Some(processed.results);
        report.artifacts = processed.artifacts;
    }
    report
}
