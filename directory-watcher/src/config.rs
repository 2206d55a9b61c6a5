//! Configuration types for a watch session.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

use crate::error::{Result, WatcherError};

/// Default size of the backend event buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Smallest accepted event buffer.
pub const MIN_BUFFER_SIZE: usize = 4 * 1024;

/// Configuration for a single watched directory.
///
/// A session takes its own copy at open time and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfiguration {
    /// Directory to watch.
    pub root_path: PathBuf,

    /// Glob filter applied to the final component of each affected path.
    #[serde(default)]
    pub name_pattern: NamePattern,

    /// Whether subdirectories are watched too.
    #[serde(default = "default_recursive")]
    pub recursive: bool,

    /// Attribute classes whose change triggers a notification.
    #[serde(default)]
    pub notify_categories: NotifyCategories,

    /// Size of the backend event buffer in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size_bytes: usize,
}

fn default_recursive() -> bool {
    true
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl WatchConfiguration {
    /// Create a configuration watching everything under `root_path`.
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            name_pattern: NamePattern::default(),
            recursive: true,
            notify_categories: NotifyCategories::default(),
            buffer_size_bytes: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Parse a configuration from TOML.
    ///
    /// ```toml
    /// root_path = "/var/log/app"
    /// name_pattern = "*.log"
    /// notify_categories = "FILE_NAME | SIZE | LAST_WRITE"
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the name filter.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = NamePattern::new(pattern);
        self
    }

    /// Only watch the top-level directory.
    pub fn non_recursive(mut self) -> Self {
        self.recursive = false;
        self
    }

    /// Restrict the attribute classes that produce notifications.
    pub fn with_categories(mut self, categories: NotifyCategories) -> Self {
        self.notify_categories = categories;
        self
    }

    /// Set the backend buffer size.
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size_bytes = bytes;
        self
    }

    /// Check values that do not depend on the filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size_bytes < MIN_BUFFER_SIZE {
            return Err(WatcherError::InvalidConfig(format!(
                "buffer_size_bytes must be at least {MIN_BUFFER_SIZE}, got {}",
                self.buffer_size_bytes
            )));
        }
        Ok(())
    }

    /// Check that the root exists and is a directory.
    pub(crate) fn validate_root(&self) -> Result<PathBuf> {
        let root = &self.root_path;
        if !root.is_dir() {
            let reason = if root.exists() {
                "not a directory"
            } else {
                "no such directory"
            };
            return Err(WatcherError::InvalidPath(format!(
                "{}: {reason}",
                root.display()
            )));
        }
        dunce::canonicalize(root)
            .map_err(|e| WatcherError::InvalidPath(format!("{}: {e}", root.display())))
    }
}

/// Glob-style filter for file and directory names.
///
/// Supports `*` and `?`. An empty pattern, `*` and `*.*` match every name.
/// Matching ignores case on Windows, where file names do too, and is exact
/// elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NamePattern {
    raw: String,
    matcher: Option<WildMatch>,
}

impl NamePattern {
    /// Compile a pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let matcher = match raw.trim() {
            "" | "*" | "*.*" => None,
            pattern if cfg!(windows) => Some(WildMatch::new_case_insensitive(pattern)),
            pattern => Some(WildMatch::new(pattern)),
        };
        Self { raw, matcher }
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether every name passes.
    pub fn matches_all(&self) -> bool {
        self.matcher.is_none()
    }

    /// Check a bare name (no separators expected).
    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            None => true,
            Some(matcher) => matcher.matches(name),
        }
    }

    /// Check the final component of `path`.
    pub fn matches_path(&self, path: &Path) -> bool {
        if self.matches_all() {
            return true;
        }
        path.file_name()
            .map(|name| self.matches(&name.to_string_lossy()))
            .unwrap_or(false)
    }
}

impl From<String> for NamePattern {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<NamePattern> for String {
    fn from(pattern: NamePattern) -> Self {
        pattern.raw
    }
}

impl From<&str> for NamePattern {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

bitflags! {
    /// Attribute classes whose change triggers a notification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NotifyCategories: u32 {
        const FILE_NAME      = 0x0001;
        const DIRECTORY_NAME = 0x0002;
        const ATTRIBUTES     = 0x0004;
        const SIZE           = 0x0008;
        const LAST_WRITE     = 0x0010;
        const LAST_ACCESS    = 0x0020;
        const CREATION_TIME  = 0x0040;
        const SECURITY       = 0x0100;
    }
}

impl NotifyCategories {
    /// Classes raised by entries appearing, disappearing or moving.
    pub const NAMES: Self = Self::FILE_NAME.union(Self::DIRECTORY_NAME);

    /// Classes raised by in-place changes.
    pub const CHANGES: Self = Self::all().difference(Self::NAMES);
}

impl Default for NotifyCategories {
    fn default() -> Self {
        Self::all()
    }
}
