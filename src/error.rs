//! Error taxonomy for the scraper orchestrator.
//!
//! Subprocess-originated failures are recovered into session state by the
//! controller; only `ConfigError` is allowed to abort a run before launch.

use crate::model::StreamSource;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a target URL is required")]
    EmptyUrl,

    #[error("page limit must be between 1 and {cap}, got {value}")]
    PageLimit { value: u32, cap: u32 },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("scraper not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("scraper at {} is not executable", .0.display())]
    NotExecutable(PathBuf),

    #[error("interpreter `{name}` not found: {source}")]
    InterpreterNotFound {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("cannot prepare session directory {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot create signal file: {0}")]
    Signal(#[from] SignalError),

    #[error("failed to spawn scraper: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("scraper {0} was not piped")]
    MissingPipe(StreamSource),
}

#[derive(Debug, Error)]
#[error("failed reading scraper {stream}: {error}")]
pub struct StreamReadError {
    pub stream: StreamSource,
    #[source]
    pub error: std::io::Error,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot replace signal file {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no results found: {} does not exist", .0.display())]
    MissingOutput(PathBuf),

    #[error("cannot read results from {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// A text field that should carry a number but does not. Collected, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("row {row}: field `{field}` has no numeric value in {raw:?}")]
pub struct MalformedRecord {
    pub row: usize,
    pub field: String,
    pub raw: String,
}
