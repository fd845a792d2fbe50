//! Child process lifecycle for the external scraper.

use crate::error::LaunchError;
use crate::model::StreamSource;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Everything needed to start one scraper run.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub scraper: &'a Path,
    /// Program that runs the scraper script (e.g. `node`). `None` runs the scraper directly.
    pub interpreter: Option<&'a str>,
    pub url: &'a str,
    pub output: &'a Path,
    pub signal: &'a Path,
    pub max_pages: u32,
    pub cwd: &'a Path,
}

/// A running scraper. Owns the child; the pipes are handed out once.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    argv: Vec<String>,
}

/// Spawn the scraper with its positional argument contract:
/// `<scraper> <url> <output> <signal> <max-pages>`.
pub fn launch(spec: &LaunchSpec<'_>) -> Result<ProcessHandle, LaunchError> {
    if !spec.scraper.is_file() {
        return Err(LaunchError::NotFound(spec.scraper.to_path_buf()));
    }

    let (program, mut argv) = match spec.interpreter {
        Some(name) => {
            let program = which::which(name).map_err(|source| LaunchError::InterpreterNotFound {
                name: name.to_string(),
                source,
            })?;
            (program, vec![spec.scraper.display().to_string()])
        }
        None => {
            if !is_executable(spec.scraper) {
                return Err(LaunchError::NotExecutable(spec.scraper.to_path_buf()));
            }
            (spec.scraper.to_path_buf(), Vec::new())
        }
    };
    argv.extend([
        spec.url.to_string(),
        spec.output.display().to_string(),
        spec.signal.display().to_string(),
        spec.max_pages.to_string(),
    ]);

    let mut cmd = Command::new(&program);
    cmd.args(&argv)
        .current_dir(spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    // `None` only once the child has been reaped, which cannot happen before spawn returns.
    let pid = child.id();

    argv.insert(0, program.display().to_string());
    info!(pid = ?pid, argv = ?argv, "scraper launched");
    Ok(ProcessHandle { child, pid, argv })
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Full command line, program first.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Take the output pipes. Fails if they were already taken.
    pub fn take_pipes(&mut self) -> Result<(ChildStdout, ChildStderr), LaunchError> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe(StreamSource::Stdout))?;
        let stderr = self
            .child
            .stderr
            .take()
            .ok_or(LaunchError::MissingPipe(StreamSource::Stderr))?;
        Ok((stdout, stderr))
    }

    /// Wait for the child to exit. Cancel-safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Best-effort kill. Only used on operator cancellation.
    pub fn terminate(&mut self) {
        match self.child.start_kill() {
            Ok(()) => info!(pid = ?self.pid, "kill delivered to scraper"),
            Err(e) => warn!(pid = ?self.pid, error = %e, "could not kill scraper"),
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolve a scraper path relative to the current directory.
pub fn absolute_scraper_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(e) => {
            debug!(error = %e, "current dir unavailable; keeping relative scraper path");
            path.to_path_buf()
        }
    }
}
