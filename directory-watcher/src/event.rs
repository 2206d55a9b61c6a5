//! Events delivered by a watch session.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A classified file system notification.
///
/// Names are relative to the watched root; for entries directly under the
/// root they equal the file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchEvent {
    /// A file or directory appeared.
    Created { path: PathBuf, name: String },

    /// Content or attributes of an entry changed.
    Changed { path: PathBuf, name: String },

    /// A file or directory disappeared.
    Deleted { path: PathBuf, name: String },

    /// An entry moved within the watched tree.
    Renamed {
        old_path: PathBuf,
        old_name: String,
        new_path: PathBuf,
        new_name: String,
    },

    /// Something went wrong while watching.
    Error { cause: WatchFault },
}

impl WatchEvent {
    /// Category this event is delivered under, `None` for errors.
    pub fn category(&self) -> Option<EventCategory> {
        match self {
            Self::Created { .. } => Some(EventCategory::Created),
            Self::Changed { .. } => Some(EventCategory::Changed),
            Self::Deleted { .. } => Some(EventCategory::Deleted),
            Self::Renamed { .. } => Some(EventCategory::Renamed),
            Self::Error { .. } => None,
        }
    }

    /// Current name of the affected entry.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Created { name, .. } | Self::Changed { name, .. } | Self::Deleted { name, .. } => {
                Some(name)
            }
            Self::Renamed { new_name, .. } => Some(new_name),
            Self::Error { .. } => None,
        }
    }

    /// Check if this is an error notification.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created { path, name } => write!(f, "created: {} ({name})", path.display()),
            Self::Changed { path, name } => write!(f, "changed: {} ({name})", path.display()),
            Self::Deleted { path, name } => write!(f, "deleted: {} ({name})", path.display()),
            Self::Renamed {
                old_path,
                old_name,
                new_path,
                new_name,
            } => write!(
                f,
                "renamed: {} ({old_name}) -> {} ({new_name})",
                old_path.display(),
                new_path.display()
            ),
            Self::Error { cause } => write!(f, "watch error: {cause}"),
        }
    }
}

/// Subscribable event categories.
///
/// Errors are not a category; they have a dedicated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Created,
    Changed,
    Deleted,
    Renamed,
}

impl EventCategory {
    /// Every category, in declaration order.
    pub const ALL: [EventCategory; 4] = [
        EventCategory::Created,
        EventCategory::Changed,
        EventCategory::Deleted,
        EventCategory::Renamed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Changed => "changed",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime faults reported after a session is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum WatchFault {
    /// The backend dropped notifications before they could be classified.
    Overflow,

    /// A handler returned an error or panicked.
    HandlerFault {
        category: EventCategory,
        message: String,
    },

    /// The backend reported an error.
    Backend { message: String },

    /// Releasing the backend watch failed during close.
    ResourceRelease { message: String },
}

impl fmt::Display for WatchFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => f.write_str("notifications lost due to buffer overflow"),
            Self::HandlerFault { category, message } => {
                write!(f, "{category} handler failed: {message}")
            }
            Self::Backend { message } => write!(f, "backend error: {message}"),
            Self::ResourceRelease { message } => {
                write!(f, "failed to release watch: {message}")
            }
        }
    }
}
