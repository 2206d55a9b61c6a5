//! Translation of raw `notify` events into [`WatchEvent`]s.
//!
//! Backends report renames differently: inotify sends `From`, `To` and a
//! trailing `Both` sharing one tracker cookie, Windows sends an untracked
//! `From`/`To` pair followed by `Both`, and FSEvents sends one `Any` per
//! side. The classifier folds all of these into a single `Renamed`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{
    CreateKind, DataChange, Flag, MetadataKind, ModifyKind, RemoveKind, RenameMode,
};
use notify::{Event, EventKind};
use tracing::trace;

use crate::config::{NamePattern, NotifyCategories, WatchConfiguration};
use crate::event::{WatchEvent, WatchFault};

/// Outcome of classifying one raw notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Classified {
    /// Deliver to listeners.
    Event(WatchEvent),
    /// Dropped by the name filter.
    Filtered,
    /// Deliver on the error stream.
    Fault(WatchFault),
}

/// Half of a rename still waiting for its other side.
#[derive(Debug)]
struct PendingRename {
    path: PathBuf,
    tracker: Option<usize>,
    since: Instant,
}

/// Stateful classifier for one session.
///
/// Must see notifications in delivery order.
#[derive(Debug)]
pub(crate) struct Classifier {
    root: PathBuf,
    pattern: NamePattern,
    categories: NotifyCategories,
    pending_from: Option<PendingRename>,
    last_pair: Option<(PathBuf, PathBuf)>,
}

impl Classifier {
    pub(crate) fn new(root: PathBuf, config: &WatchConfiguration) -> Self {
        Self {
            root,
            pattern: config.name_pattern.clone(),
            categories: config.notify_categories,
            pending_from: None,
            last_pair: None,
        }
    }

    /// Classify one raw notification.
    pub(crate) fn classify(&mut self, event: &Event) -> Vec<Classified> {
        trace!("raw event: {event:?}");

        if event.flag() == Some(Flag::Rescan) {
            let mut out = self.flush_pending();
            out.push(Classified::Fault(WatchFault::Overflow));
            return out;
        }

        if let EventKind::Modify(ModifyKind::Name(mode)) = event.kind {
            return self.classify_rename(mode, event);
        }

        let mut out = self.flush_pending();
        self.last_pair = None;
        for path in &event.paths {
            if let Some(classified) = self.classify_simple(event.kind, path) {
                out.push(classified);
            }
        }
        out
    }

    fn classify_simple(&self, kind: EventKind, path: &Path) -> Option<Classified> {
        match kind {
            EventKind::Create(create) => {
                let class = match create {
                    CreateKind::File => NotifyCategories::FILE_NAME,
                    CreateKind::Folder => NotifyCategories::DIRECTORY_NAME,
                    _ => name_class(path),
                };
                self.entry_event(class, path, |path, name| WatchEvent::Created { path, name })
            }
            EventKind::Remove(remove) => {
                let class = match remove {
                    RemoveKind::Folder => NotifyCategories::DIRECTORY_NAME,
                    _ => NotifyCategories::FILE_NAME,
                };
                self.entry_event(class, path, |path, name| WatchEvent::Deleted { path, name })
            }
            EventKind::Modify(modify) => self.entry_event(change_class(modify), path, |path, name| {
                WatchEvent::Changed { path, name }
            }),
            EventKind::Any => self.entry_event(NotifyCategories::CHANGES, path, |path, name| {
                WatchEvent::Changed { path, name }
            }),
            // Access is not a change; timestamp updates arrive as metadata events.
            EventKind::Access(_) | EventKind::Other => None,
        }
    }

    fn classify_rename(&mut self, mode: RenameMode, event: &Event) -> Vec<Classified> {
        let tracker = event.tracker();
        match mode {
            RenameMode::Both => {
                let [old, new] = match event.paths.as_slice() {
                    [old, new, ..] => [old.clone(), new.clone()],
                    _ => return Vec::new(),
                };
                if self.last_pair.take().as_ref() == Some(&(old.clone(), new.clone())) {
                    return Vec::new();
                }
                let mut out: Vec<_> = match self.pending_from.take() {
                    Some(pending) if pending.path == old => Vec::new(),
                    Some(pending) => self.deleted(&pending.path).into_iter().collect(),
                    None => Vec::new(),
                };
                out.extend(self.renamed(&old, &new));
                out
            }
            RenameMode::From => self.rename_from(event.paths.first(), tracker),
            RenameMode::To => self.rename_to(event.paths.first(), tracker),
            RenameMode::Any | RenameMode::Other => match event.paths.first() {
                Some(path) if path.exists() => self.rename_to(Some(path), tracker),
                path => self.rename_from(path, tracker),
            },
        }
    }

    fn rename_from(&mut self, path: Option<&PathBuf>, tracker: Option<usize>) -> Vec<Classified> {
        let out = self.flush_pending();
        self.last_pair = None;
        if let Some(path) = path {
            self.pending_from = Some(PendingRename {
                path: path.clone(),
                tracker,
                since: Instant::now(),
            });
        }
        out
    }

    fn rename_to(&mut self, path: Option<&PathBuf>, tracker: Option<usize>) -> Vec<Classified> {
        let Some(path) = path else {
            return Vec::new();
        };
        self.last_pair = None;
        match self.pending_from.take() {
            Some(pending) if pending.tracker == tracker => {
                self.last_pair = Some((pending.path.clone(), path.clone()));
                self.renamed(&pending.path, path).into_iter().collect()
            }
            Some(pending) => self
                .deleted(&pending.path)
                .into_iter()
                .chain(self.created(path))
                .collect(),
            None => self.created(path).into_iter().collect(),
        }
    }

    /// Give up on a `From` that has waited at least `timeout` for its `To`.
    ///
    /// `Duration::ZERO` flushes unconditionally.
    pub(crate) fn expire_pending(&mut self, timeout: Duration) -> Vec<Classified> {
        let expired = self
            .pending_from
            .as_ref()
            .is_some_and(|pending| pending.since.elapsed() >= timeout);
        if expired {
            self.flush_pending()
        } else {
            Vec::new()
        }
    }

    /// An unmatched `From` means the entry left the watched tree.
    fn flush_pending(&mut self) -> Vec<Classified> {
        match self.pending_from.take() {
            Some(pending) => self.deleted(&pending.path).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn renamed(&self, old: &Path, new: &Path) -> Option<Classified> {
        if !self.categories.intersects(name_class(new)) {
            return None;
        }
        if !self.pattern.matches_path(old) && !self.pattern.matches_path(new) {
            return Some(Classified::Filtered);
        }
        Some(Classified::Event(WatchEvent::Renamed {
            old_path: old.to_path_buf(),
            old_name: self.relative_name(old),
            new_path: new.to_path_buf(),
            new_name: self.relative_name(new),
        }))
    }

    fn created(&self, path: &Path) -> Option<Classified> {
        self.entry_event(name_class(path), path, |path, name| WatchEvent::Created {
            path,
            name,
        })
    }

    fn deleted(&self, path: &Path) -> Option<Classified> {
        // Class is unknown once the entry is gone.
        self.entry_event(NotifyCategories::NAMES, path, |path, name| {
            WatchEvent::Deleted { path, name }
        })
    }

    fn entry_event(
        &self,
        class: NotifyCategories,
        path: &Path,
        build: impl FnOnce(PathBuf, String) -> WatchEvent,
    ) -> Option<Classified> {
        if !self.categories.intersects(class) {
            return None;
        }
        if !self.pattern.matches_path(path) {
            return Some(Classified::Filtered);
        }
        Some(Classified::Event(build(
            path.to_path_buf(),
            self.relative_name(path),
        )))
    }

    fn relative_name(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Name class of an entry that still exists on disk.
fn name_class(path: &Path) -> NotifyCategories {
    if path.is_dir() {
        NotifyCategories::DIRECTORY_NAME
    } else {
        NotifyCategories::FILE_NAME
    }
}

/// Attribute classes a modification may stem from.
fn change_class(kind: ModifyKind) -> NotifyCategories {
    match kind {
        ModifyKind::Data(DataChange::Size) => NotifyCategories::SIZE,
        ModifyKind::Data(DataChange::Content) => NotifyCategories::LAST_WRITE,
        ModifyKind::Data(_) => NotifyCategories::SIZE | NotifyCategories::LAST_WRITE,
        ModifyKind::Metadata(MetadataKind::AccessTime) => NotifyCategories::LAST_ACCESS,
        ModifyKind::Metadata(MetadataKind::WriteTime) => NotifyCategories::LAST_WRITE,
        ModifyKind::Metadata(MetadataKind::Permissions | MetadataKind::Ownership) => {
            NotifyCategories::SECURITY
        }
        ModifyKind::Metadata(MetadataKind::Extended) => NotifyCategories::ATTRIBUTES,
        _ => NotifyCategories::CHANGES,
    }
}
