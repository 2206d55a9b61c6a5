//! Diagnostic output for a watch session.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::event::WatchEvent;
use crate::registry::Handler;

/// Severity of a diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Receives human-readable lines about a session.
///
/// The format is not a stable contract.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, level: DiagnosticLevel, line: &str);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, level: DiagnosticLevel, line: &str) {
        match level {
            DiagnosticLevel::Debug => debug!("{line}"),
            DiagnosticLevel::Info => info!("{line}"),
            DiagnosticLevel::Warn => warn!("{line}"),
            DiagnosticLevel::Error => error!("{line}"),
        }
    }
}

/// Handler that writes one line per event to `sink`.
///
/// Registered on every stream when a session is opened with default
/// logging.
pub fn logging_handler(sink: Arc<dyn DiagnosticSink>) -> Handler {
    Arc::new(move |event: &WatchEvent| -> anyhow::Result<()> {
        let level = if event.is_error() {
            DiagnosticLevel::Warn
        } else {
            DiagnosticLevel::Debug
        };
        sink.emit(level, &event.to_string());
        Ok(())
    })
}
