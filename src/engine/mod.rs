//! Plumbing between the orchestrator and the external scraper process:
//! spawning it, reading its output, and writing its signal slot.

pub(crate) mod classify;
mod signal;
mod stream;
mod supervisor;

pub use signal::SignalChannel;
pub use stream::{EventStream, StreamUpdate};
pub use supervisor::{absolute_scraper_path, launch, LaunchSpec, ProcessHandle};
