//! Single-slot mailbox file shared with the scraper.
//!
//! The path is fixed when the session starts and handed to the scraper once.
//! Every write replaces the whole content atomically at that same path.

use crate::error::SignalError;
use crate::model::SignalToken;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct SignalChannel {
    path: PathBuf,
}

impl SignalChannel {
    /// Create the slot holding `none`. Called once per session, before launch.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SignalError> {
        let channel = Self { path: path.into() };
        channel.write_signal(SignalToken::None)?;
        Ok(channel)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the slot with `token`.
    ///
    /// The content is staged in a sibling temp file and renamed over the slot, so
    /// the scraper never observes a partial token. If the scraper cleared the slot
    /// by unlinking it, the rename puts it back at the same path.
    pub fn write_signal(&self, token: SignalToken) -> Result<(), SignalError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let io_err = |source| SignalError::Io {
            path: self.path.clone(),
            source,
        };

        let mut staged = tempfile::Builder::new()
            .prefix(".signal-")
            .tempfile_in(dir)
            .map_err(io_err)?;
        staged
            .write_all(token.as_str().as_bytes())
            .map_err(io_err)?;
        staged.as_file().sync_all().map_err(io_err)?;
        staged
            .persist(&self.path)
            .map_err(|e| SignalError::Persist {
                path: self.path.clone(),
                source: e.error,
            })?;

        debug!(path = %self.path.display(), token = token.as_str(), "signal written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_slot_with_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.txt");
        assert!(!path.exists());

        let channel = SignalChannel::open(&path).unwrap();
        assert_eq!(channel.path(), path.as_path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "none");
    }

    #[test]
    fn repeated_token_leaves_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.txt");
        let channel = SignalChannel::open(&path).unwrap();

        channel.write_signal(SignalToken::CaptchaSolved).unwrap();
        let once = std::fs::read(&path).unwrap();
        channel.write_signal(SignalToken::CaptchaSolved).unwrap();
        let twice = std::fs::read(&path).unwrap();

        assert_eq!(once, b"captcha_solved");
        assert_eq!(once, twice);
    }

    #[test]
    fn overwrite_replaces_previous_token_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.txt");
        let channel = SignalChannel::open(&path).unwrap();

        channel.write_signal(SignalToken::CaptchaSolved).unwrap();
        channel.write_signal(SignalToken::ElementSelected).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "element_selected");
        assert_eq!(channel.path(), path.as_path());
        // No staging files are left behind next to the slot.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn slot_is_restored_after_reader_unlinks_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.txt");
        let channel = SignalChannel::open(&path).unwrap();

        std::fs::remove_file(&path).unwrap();
        channel.write_signal(SignalToken::ElementSelected).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "element_selected");
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join("signal.txt");
        assert!(matches!(
            SignalChannel::open(&path),
            Err(SignalError::Io { .. })
        ));
    }
}
