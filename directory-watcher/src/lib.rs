//! # Directory Watch Session
//!
//! A thin, thread-safe layer over the platform file-change notifier. A
//! session watches one directory subtree, filters names with a glob
//! pattern, and hands out four kinds of events plus an error stream.
//!
//! ## Features
//!
//! - **Typed Events**: Created, Changed, Deleted and Renamed, with renames
//!   always reported as one event carrying both identities
//! - **Name Filtering**: `*.log`-style patterns on the final path component
//! - **Fault Isolation**: failing handlers and backend overflows surface on
//!   the error stream instead of taking the host down
//! - **Safe Teardown**: `close` is idempotent and never fails
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    DirectoryWatchSession                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  notify backend ──► Classifier ──► ListenerRegistry ──► Handler │
//! │                        │                  │                     │
//! │                        ▼                  ▼                     │
//! │                   NamePattern       error stream / sink         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dirwatch_session::{DirectoryWatchSession, EventCategory, Handler, WatchEvent};
//!
//! # fn main() -> dirwatch_session::Result<()> {
//! let session = DirectoryWatchSession::open("/tmp/watched", "*.log", false)?;
//! let handler: Handler = Arc::new(|event: &WatchEvent| -> anyhow::Result<()> {
//!     println!("{event}");
//!     Ok(())
//! });
//! session.on(EventCategory::Created, handler)?;
//! session.close();
//! # Ok(())
//! # }
//! ```

mod classify;
pub mod config;
pub mod error;
pub mod event;
mod registry;
pub mod session;
pub mod sink;

pub use config::{NamePattern, NotifyCategories, WatchConfiguration};
pub use error::{Result, WatcherError};
pub use event::{EventCategory, WatchEvent, WatchFault};
pub use registry::Handler;
pub use session::{DirectoryWatchSession, EventStream, SessionOptions, SessionStats};
pub use sink::{DiagnosticLevel, DiagnosticSink, TracingSink, logging_handler};
