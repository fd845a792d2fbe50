//! Application-level orchestration utilities.
//!
//! This module owns the session lifecycle (launch, operator hand-offs, cancel) and
//! post-run processing such as result ingestion and artifact collection. The CLI
//! layer calls into this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_session, OperatorCommand};
