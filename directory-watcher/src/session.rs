//! Directory watch session.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::classify::{Classified, Classifier};
use crate::config::WatchConfiguration;
use crate::error::Result;
use crate::event::{EventCategory, WatchEvent, WatchFault};
use crate::registry::{Handler, ListenerRegistry, Stream};
use crate::sink::{DiagnosticLevel, DiagnosticSink, TracingSink, logging_handler};

/// How long a rename `From` waits for its `To` before it counts as a delete.
const RENAME_PAIR_TIMEOUT: Duration = Duration::from_millis(500);

const TICK_INTERVAL: Duration = Duration::from_millis(100);

thread_local! {
    /// Set while this thread is delivering notifications for some session.
    static DELIVERING: Cell<bool> = const { Cell::new(false) };
}

struct DeliveryGuard {
    previous: bool,
}

impl DeliveryGuard {
    fn enter() -> Self {
        Self {
            previous: DELIVERING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        DELIVERING.with(|flag| flag.set(self.previous));
    }
}

/// Construction options beyond the watch configuration.
#[derive(Clone)]
pub struct SessionOptions {
    /// Observer registered on every stream at open time.
    pub default_observer: Option<Arc<dyn DiagnosticSink>>,

    /// Sink for faults that cannot be delivered as events.
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl SessionOptions {
    /// Log every event through `tracing`.
    pub fn with_default_logging(self) -> Self {
        self.with_default_observer(Arc::new(TracingSink))
    }

    /// Log every event to `sink`.
    pub fn with_default_observer(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.default_observer = Some(sink);
        self
    }

    /// Route internal diagnostics to `sink`.
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = sink;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            default_observer: None,
            diagnostics: Arc::new(TracingSink),
        }
    }
}

/// Counters for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Created events delivered.
    pub created: u64,

    /// Changed events delivered.
    pub changed: u64,

    /// Deleted events delivered.
    pub deleted: u64,

    /// Renamed events delivered.
    pub renamed: u64,

    /// Notifications dropped by the name filter.
    pub filtered: u64,

    /// Overflow notifications.
    pub overflows: u64,

    /// Handler errors and panics.
    pub handler_faults: u64,

    /// Errors reported by the backend.
    pub backend_errors: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    changed: AtomicU64,
    deleted: AtomicU64,
    renamed: AtomicU64,
    filtered: AtomicU64,
    overflows: AtomicU64,
    handler_faults: AtomicU64,
    backend_errors: AtomicU64,
}

impl Counters {
    fn record_event(&self, category: EventCategory) {
        let counter = match category {
            EventCategory::Created => &self.created,
            EventCategory::Changed => &self.changed,
            EventCategory::Deleted => &self.deleted,
            EventCategory::Renamed => &self.renamed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fault(&self, fault: &WatchFault) {
        let counter = match fault {
            WatchFault::Overflow => &self.overflows,
            WatchFault::HandlerFault { .. } => &self.handler_faults,
            WatchFault::Backend { .. } => &self.backend_errors,
            WatchFault::ResourceRelease { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            created: self.created.load(Ordering::Relaxed),
            changed: self.changed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            renamed: self.renamed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// A running backend watch.
pub(crate) trait WatchHandle: Send {
    /// Stop the backend and free its OS resources.
    ///
    /// `from_callback` is set when called on the backend's delivery thread.
    fn release(self: Box<Self>, from_callback: bool) -> Result<()>;
}

struct NotifyHandle {
    watcher: RecommendedWatcher,
    root: PathBuf,
}

impl WatchHandle for NotifyHandle {
    fn release(self: Box<Self>, from_callback: bool) -> Result<()> {
        let Self { mut watcher, root } = *self;
        // unwatch waits on the delivery thread; from there dropping is enough.
        if !from_callback {
            watcher.unwatch(&root)?;
        }
        drop(watcher);
        Ok(())
    }
}

fn start_notify(root: &Path, recursive: bool, shared: Arc<Shared>) -> Result<Box<dyn WatchHandle>> {
    let mut watcher = notify::recommended_watcher(
        move |res: std::result::Result<notify::Event, notify::Error>| shared.ingest(res),
    )?;
    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(root, mode)?;
    Ok(Box::new(NotifyHandle {
        watcher,
        root: root.to_path_buf(),
    }))
}

/// Expire unpaired rename halves until the session closes or goes away.
fn spawn_rename_timer(shared: Weak<Shared>) -> Result<()> {
    thread::Builder::new()
        .name("dirwatch-rename-timer".to_string())
        .spawn(move || {
            loop {
                thread::sleep(TICK_INTERVAL);
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.registry.is_open() {
                    break;
                }
                shared.expire_pending(RENAME_PAIR_TIMEOUT);
            }
            trace!("rename timer stopped");
        })?;
    Ok(())
}

/// State reachable from the backend's delivery thread.
pub(crate) struct Shared {
    registry: ListenerRegistry,
    classifier: Mutex<Classifier>,
    diagnostics: Arc<dyn DiagnosticSink>,
    counters: Counters,
}

impl Shared {
    /// Classify one raw notification and deliver the result.
    pub(crate) fn ingest(&self, raw: std::result::Result<notify::Event, notify::Error>) {
        let _delivering = DeliveryGuard::enter();
        // Held through dispatch so notifications are delivered in order.
        let mut classifier = self.classifier.lock();
        if !self.registry.is_open() {
            return;
        }

        let outcomes = match raw {
            Ok(event) => classifier.classify(&event),
            Err(err) => {
                error!("watch backend error: {err}");
                vec![Classified::Fault(WatchFault::Backend {
                    message: err.to_string(),
                })]
            }
        };
        self.apply(outcomes);
    }

    /// Deliver a rename half that waited longer than `timeout` as a delete.
    pub(crate) fn expire_pending(&self, timeout: Duration) {
        let _delivering = DeliveryGuard::enter();
        let mut classifier = self.classifier.lock();
        if !self.registry.is_open() {
            return;
        }
        let outcomes = classifier.expire_pending(timeout);
        self.apply(outcomes);
    }

    /// Flush any pending rename half ahead of close.
    ///
    /// On a delivery thread the classifier may already be held by this very
    /// thread, so the flush is skipped when the lock is taken.
    fn drain_pending(&self, from_callback: bool) {
        let classifier = if from_callback {
            self.classifier.try_lock()
        } else {
            Some(self.classifier.lock())
        };
        let Some(mut classifier) = classifier else {
            return;
        };
        if !self.registry.is_open() {
            return;
        }
        let outcomes = classifier.expire_pending(Duration::ZERO);
        self.apply(outcomes);
    }

    fn apply(&self, outcomes: Vec<Classified>) {
        for outcome in outcomes {
            match outcome {
                Classified::Event(event) => self.deliver(event),
                Classified::Filtered => {
                    self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                }
                Classified::Fault(fault) => self.report(fault),
            }
        }
    }

    fn deliver(&self, event: WatchEvent) {
        let Some(category) = event.category() else {
            return;
        };
        self.counters.record_event(category);

        let report = self.registry.dispatch(Stream::Category(category), &event);
        debug!(handlers = report.invoked, "{event}");
        for message in report.faults {
            self.report(WatchFault::HandlerFault { category, message });
        }
    }

    fn report(&self, fault: WatchFault) {
        warn!("{fault}");
        self.counters.record_fault(&fault);

        let event = WatchEvent::Error { cause: fault };
        let report = self.registry.dispatch(Stream::Errors, &event);
        for message in report.faults {
            self.diagnostics.emit(
                DiagnosticLevel::Warn,
                &format!("error handler failed: {message}"),
            );
        }
    }
}

/// An open watch on one directory subtree.
///
/// The session is either open or closed; [`close`](Self::close) is the only
/// transition and is also run on drop. Once closed, subscription methods
/// return [`WatcherError::SessionClosed`](crate::WatcherError::SessionClosed)
/// while the read-only accessors keep working.
pub struct DirectoryWatchSession {
    config: WatchConfiguration,
    shared: Arc<Shared>,
    handle: Mutex<Option<Box<dyn WatchHandle>>>,
    close_observer: Option<Arc<dyn DiagnosticSink>>,
}

impl DirectoryWatchSession {
    /// Watch `root_path` recursively for names matching `name_pattern`.
    ///
    /// With `enable_default_logging`, every event is logged through
    /// `tracing`.
    pub fn open(
        root_path: impl Into<PathBuf>,
        name_pattern: &str,
        enable_default_logging: bool,
    ) -> Result<Self> {
        let config = WatchConfiguration::new(root_path).with_pattern(name_pattern);
        let options = if enable_default_logging {
            SessionOptions::default().with_default_logging()
        } else {
            SessionOptions::default()
        };
        Self::open_with(config, options)
    }

    /// Open a session from a full configuration.
    pub fn open_with(config: WatchConfiguration, options: SessionOptions) -> Result<Self> {
        Self::open_with_backend(config, options, start_notify)
    }

    pub(crate) fn open_with_backend<F>(
        config: WatchConfiguration,
        options: SessionOptions,
        start: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Path, bool, Arc<Shared>) -> Result<Box<dyn WatchHandle>>,
    {
        config.validate()?;
        let root = config.validate_root()?;
        let config = WatchConfiguration {
            root_path: root,
            ..config
        };

        let shared = Arc::new(Shared {
            registry: ListenerRegistry::new(),
            classifier: Mutex::new(Classifier::new(config.root_path.clone(), &config)),
            diagnostics: options.diagnostics,
            counters: Counters::default(),
        });

        if let Some(observer) = &options.default_observer {
            let handler = logging_handler(Arc::clone(observer));
            for category in EventCategory::ALL {
                shared
                    .registry
                    .add(Stream::Category(category), Arc::clone(&handler))?;
            }
            shared.registry.add(Stream::Errors, handler)?;
        }

        spawn_rename_timer(Arc::downgrade(&shared))?;

        // Last step: notifications may arrive as soon as the backend starts.
        let handle = start(&config.root_path, config.recursive, Arc::clone(&shared))?;

        info!(
            root = %config.root_path.display(),
            pattern = config.name_pattern.as_str(),
            recursive = config.recursive,
            buffer_size = config.buffer_size_bytes,
            "watch session opened"
        );

        Ok(Self {
            config,
            shared,
            handle: Mutex::new(Some(handle)),
            close_observer: options.default_observer,
        })
    }

    /// Subscribe `handler` to one category.
    pub fn on(&self, category: EventCategory, handler: Handler) -> Result<()> {
        self.shared
            .registry
            .add(Stream::Category(category), handler)
    }

    /// Remove one registration of `handler` from a category.
    ///
    /// Returns `false` if it was not registered. When called from another
    /// thread while an event is being delivered, `handler` may still see
    /// that one event.
    pub fn off(&self, category: EventCategory, handler: &Handler) -> Result<bool> {
        self.shared
            .registry
            .remove(Stream::Category(category), handler)
    }

    /// Subscribe `handler` to the error stream.
    pub fn on_error(&self, handler: Handler) -> Result<()> {
        self.shared.registry.add(Stream::Errors, handler)
    }

    /// Remove one registration of `handler` from the error stream.
    pub fn off_error(&self, handler: &Handler) -> Result<bool> {
        self.shared.registry.remove(Stream::Errors, handler)
    }

    /// Receive every event, errors included, on a channel.
    ///
    /// The channel ends when the session closes. Dropping the returned
    /// stream unsubscribes it.
    pub fn event_stream(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |event: &WatchEvent| -> anyhow::Result<()> {
            if tx.send(event.clone()).is_err() {
                debug!("event stream receiver dropped");
            }
            Ok(())
        });
        let stream = EventStream {
            rx,
            shared: Arc::downgrade(&self.shared),
            handler: Arc::downgrade(&handler),
        };
        for category in EventCategory::ALL {
            self.on(category, Arc::clone(&handler))?;
        }
        self.on_error(handler)?;
        Ok(stream)
    }

    /// Canonical path of the watched directory.
    pub fn root_path(&self) -> &Path {
        &self.config.root_path
    }

    pub fn config(&self) -> &WatchConfiguration {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.shared.registry.is_open()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }

    /// Stop delivery and release the backend watch.
    ///
    /// Idempotent and infallible. A handler already running on another
    /// thread is allowed to finish.
    pub fn close(&self) {
        let from_callback = DELIVERING.with(Cell::get);
        // A file moved out just before close still gets its delete.
        self.shared.drain_pending(from_callback);
        if !self.shared.registry.close() {
            return;
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.release(from_callback) {
                let fault = WatchFault::ResourceRelease {
                    message: err.to_string(),
                };
                self.shared
                    .diagnostics
                    .emit(DiagnosticLevel::Warn, &fault.to_string());
            }
        }

        if let Some(observer) = &self.close_observer {
            observer.emit(
                DiagnosticLevel::Info,
                &format!("watch session closed: {}", self.root_path().display()),
            );
        }
        info!(root = %self.root_path().display(), "watch session closed");
    }
}

impl Drop for DirectoryWatchSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiving half of [`DirectoryWatchSession::event_stream`].
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    shared: Weak<Shared>,
    // Weak so the sender drops, ending the channel, once the session closes.
    handler: Weak<dyn Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync>,
}

impl EventStream {
    /// Wait for the next event; `None` once the session has closed.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let (Some(shared), Some(handler)) = (self.shared.upgrade(), self.handler.upgrade()) else {
            return;
        };
        for stream in Stream::ALL {
            // Fails only once the session closed, which already cleared it.
            if shared.registry.remove(stream, &handler).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WatcherError;
    use notify::event::{CreateKind, DataChange, Flag, ModifyKind, RemoveKind, RenameMode};
    use notify::{Event, EventKind};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Lines(Mutex<Vec<(DiagnosticLevel, String)>>);

    impl DiagnosticSink for Lines {
        fn emit(&self, level: DiagnosticLevel, line: &str) {
            self.0.lock().push((level, line.to_string()));
        }
    }

    impl Lines {
        fn texts(&self) -> Vec<String> {
            self.0.lock().iter().map(|(_, line)| line.clone()).collect()
        }
    }

    #[derive(Default)]
    struct ReleaseLog {
        calls: AtomicUsize,
        from_callback: AtomicBool,
    }

    struct ScriptedHandle {
        log: Arc<ReleaseLog>,
        fail: bool,
    }

    impl WatchHandle for ScriptedHandle {
        fn release(self: Box<Self>, from_callback: bool) -> Result<()> {
            self.log.calls.fetch_add(1, Ordering::SeqCst);
            self.log.from_callback.store(from_callback, Ordering::SeqCst);
            if self.fail {
                return Err(WatcherError::Io(std::io::Error::other("handle busy")));
            }
            Ok(())
        }
    }

    struct Harness {
        session: Arc<DirectoryWatchSession>,
        feed: Arc<Shared>,
        release: Arc<ReleaseLog>,
        _dir: TempDir,
    }

    impl Harness {
        fn open(pattern: &str) -> Self {
            Self::open_with(pattern, SessionOptions::default(), false)
        }

        fn open_with(pattern: &str, options: SessionOptions, fail_release: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let release = Arc::new(ReleaseLog::default());
            let mut feed = None;
            let session = DirectoryWatchSession::open_with_backend(
                WatchConfiguration::new(dir.path()).with_pattern(pattern),
                options,
                |_, _, shared| {
                    feed = Some(shared);
                    Ok(Box::new(ScriptedHandle {
                        log: Arc::clone(&release),
                        fail: fail_release,
                    }))
                },
            )
            .unwrap();
            Self {
                session: Arc::new(session),
                feed: feed.unwrap(),
                release,
                _dir: dir,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.session.root_path().join(name)
        }

        fn send(&self, event: Event) {
            self.feed.ingest(Ok(event));
        }

        fn create(&self, name: &str) {
            self.send(Event::new(EventKind::Create(CreateKind::File)).add_path(self.path(name)));
        }

        fn modify(&self, name: &str) {
            self.send(
                Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                    .add_path(self.path(name)),
            );
        }

        fn remove(&self, name: &str) {
            self.send(Event::new(EventKind::Remove(RemoveKind::File)).add_path(self.path(name)));
        }

        fn rename(&self, from: &str, to: &str, cookie: usize) {
            let name = |mode| EventKind::Modify(ModifyKind::Name(mode));
            self.send(Event::new(name(RenameMode::From)).add_path(self.path(from)).set_tracker(cookie));
            self.send(Event::new(name(RenameMode::To)).add_path(self.path(to)).set_tracker(cookie));
            self.send(
                Event::new(name(RenameMode::Both))
                    .add_path(self.path(from))
                    .add_path(self.path(to))
                    .set_tracker(cookie),
            );
        }
    }

    fn recorder() -> (Handler, Arc<Mutex<Vec<WatchEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |event: &WatchEvent| -> anyhow::Result<()> {
            sink.lock().push(event.clone());
            Ok(())
        });
        (handler, seen)
    }

    fn subscribe_all(session: &DirectoryWatchSession, handler: &Handler) {
        for category in EventCategory::ALL {
            session.on(category, Arc::clone(handler)).unwrap();
        }
        session.on_error(Arc::clone(handler)).unwrap();
    }

    #[test]
    fn test_log_pattern_scenario() {
        let h = Harness::open("*.log");
        let (handler, seen) = recorder();
        subscribe_all(&h.session, &handler);

        h.create("a.log");
        h.create("b.txt");
        h.rename("a.log", "a2.log", 11);
        h.remove("a2.log");

        assert_eq!(
            *seen.lock(),
            vec![
                WatchEvent::Created {
                    path: h.path("a.log"),
                    name: "a.log".to_string(),
                },
                WatchEvent::Renamed {
                    old_path: h.path("a.log"),
                    old_name: "a.log".to_string(),
                    new_path: h.path("a2.log"),
                    new_name: "a2.log".to_string(),
                },
                WatchEvent::Deleted {
                    path: h.path("a2.log"),
                    name: "a2.log".to_string(),
                },
            ]
        );

        let stats = h.session.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.renamed, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.filtered, 1);
    }

    #[test]
    fn test_open_rejects_invalid_roots() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"data").unwrap();

        for root in [dir.path().join("missing"), file] {
            let result = DirectoryWatchSession::open_with_backend(
                WatchConfiguration::new(&root),
                SessionOptions::default(),
                |_, _, _| -> Result<Box<dyn WatchHandle>> {
                    panic!("backend must not start for {}", root.display())
                },
            );
            assert!(matches!(result, Err(WatcherError::InvalidPath(_))));
        }
    }

    #[test]
    fn test_duplicate_registration_counts() {
        let h = Harness::open("*.log");
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: Handler = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_: &WatchEvent| -> anyhow::Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        h.session.on(EventCategory::Changed, Arc::clone(&handler)).unwrap();
        h.session.on(EventCategory::Changed, Arc::clone(&handler)).unwrap();
        h.modify("a.log");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(h.session.off(EventCategory::Changed, &handler).unwrap());
        h.modify("a.log");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Other categories never saw it.
        assert!(!h.session.off(EventCategory::Created, &handler).unwrap());
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let h = Harness::open("");
        let (handler, seen) = recorder();
        subscribe_all(&h.session, &handler);

        h.session.close();
        h.session.close();
        assert!(!h.session.is_open());
        assert_eq!(h.release.calls.load(Ordering::SeqCst), 1);

        h.create("late.txt");
        assert!(seen.lock().is_empty());

        assert!(matches!(
            h.session.on(EventCategory::Created, Arc::clone(&handler)),
            Err(WatcherError::SessionClosed)
        ));
        assert!(matches!(
            h.session.off(EventCategory::Created, &handler),
            Err(WatcherError::SessionClosed)
        ));
        assert!(matches!(
            h.session.on_error(handler),
            Err(WatcherError::SessionClosed)
        ));
        assert!(matches!(
            h.session.event_stream(),
            Err(WatcherError::SessionClosed)
        ));
        assert_eq!(
            h.session.root_path(),
            dunce::canonicalize(h._dir.path()).unwrap()
        );
    }

    #[test]
    fn test_release_failure_is_logged_not_raised() {
        let lines = Arc::new(Lines::default());
        let h = Harness::open_with(
            "",
            SessionOptions::default().with_diagnostics(lines.clone()),
            true,
        );

        h.session.close();

        assert_eq!(h.release.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            lines.texts(),
            vec!["failed to release watch: io error: handle busy".to_string()]
        );
    }

    #[test]
    fn test_handler_fault_is_reported_and_isolated() {
        let h = Harness::open("");
        let (errors, seen_errors) = recorder();
        let (after, seen_after) = recorder();

        h.session.on_error(errors).unwrap();
        h.session
            .on(
                EventCategory::Created,
                Arc::new(|_: &WatchEvent| -> anyhow::Result<()> {
                    anyhow::bail!("index unavailable")
                }),
            )
            .unwrap();
        h.session
            .on(
                EventCategory::Created,
                Arc::new(|_: &WatchEvent| -> anyhow::Result<()> { panic!("bad handler") }),
            )
            .unwrap();
        h.session.on(EventCategory::Created, after).unwrap();

        h.create("report.csv");

        assert_eq!(seen_after.lock().len(), 1);
        assert_eq!(
            *seen_errors.lock(),
            vec![
                WatchEvent::Error {
                    cause: WatchFault::HandlerFault {
                        category: EventCategory::Created,
                        message: "index unavailable".to_string(),
                    },
                },
                WatchEvent::Error {
                    cause: WatchFault::HandlerFault {
                        category: EventCategory::Created,
                        message: "handler panicked: bad handler".to_string(),
                    },
                },
            ]
        );
        assert_eq!(h.session.stats().handler_faults, 2);
        assert!(h.session.is_open());
    }

    #[test]
    fn test_faulty_error_handler_goes_to_diagnostics() {
        let lines = Arc::new(Lines::default());
        let h = Harness::open_with(
            "",
            SessionOptions::default().with_diagnostics(lines.clone()),
            false,
        );
        h.session
            .on_error(Arc::new(|_: &WatchEvent| -> anyhow::Result<()> {
                anyhow::bail!("alerting down")
            }))
            .unwrap();

        h.send(Event::new(EventKind::Other).set_flag(Flag::Rescan));

        assert_eq!(
            lines.texts(),
            vec!["error handler failed: alerting down".to_string()]
        );
    }

    #[test]
    fn test_overflow_reported_once_without_synthetic_events() {
        let h = Harness::open("");
        let (handler, seen) = recorder();
        subscribe_all(&h.session, &handler);

        h.send(Event::new(EventKind::Other).set_flag(Flag::Rescan));

        assert_eq!(
            *seen.lock(),
            vec![WatchEvent::Error {
                cause: WatchFault::Overflow,
            }]
        );
        assert_eq!(h.session.stats().overflows, 1);
        assert!(h.session.is_open());
    }

    #[test]
    fn test_backend_error_reaches_error_stream() {
        let h = Harness::open("");
        let (handler, seen) = recorder();
        h.session.on_error(handler).unwrap();

        h.feed.ingest(Err(notify::Error::generic("inotify read failed")));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            WatchEvent::Error { cause: WatchFault::Backend { message } }
                if message.contains("inotify read failed")
        ));
        assert_eq!(h.session.stats().backend_errors, 1);
    }

    #[test]
    fn test_default_observer_logs_every_stream() {
        let lines = Arc::new(Lines::default());
        let h = Harness::open_with(
            "*.log",
            SessionOptions::default().with_default_observer(lines.clone()),
            false,
        );

        h.create("a.log");
        h.modify("a.log");
        h.send(Event::new(EventKind::Other).set_flag(Flag::Rescan));
        h.session.close();

        let root = h.session.root_path().display().to_string();
        let a = h.path("a.log").display().to_string();
        assert_eq!(
            lines.texts(),
            vec![
                format!("created: {a} (a.log)"),
                format!("changed: {a} (a.log)"),
                "watch error: notifications lost due to buffer overflow".to_string(),
                format!("watch session closed: {root}"),
            ]
        );
    }

    #[test]
    fn test_no_handlers_without_default_logging() {
        let h = Harness::open("");
        for category in EventCategory::ALL {
            assert_eq!(h.session.shared.registry.len(Stream::Category(category)), 0);
        }
        assert_eq!(h.session.shared.registry.len(Stream::Errors), 0);
    }

    #[test]
    fn test_close_from_handler_skips_blocking_unwatch() {
        let h = Harness::open("");
        let (handler, seen) = recorder();
        let closer: Handler = {
            let session = Arc::downgrade(&h.session);
            Arc::new(move |_: &WatchEvent| -> anyhow::Result<()> {
                if let Some(session) = session.upgrade() {
                    session.close();
                }
                Ok(())
            })
        };
        h.session.on(EventCategory::Created, closer).unwrap();
        h.session.on(EventCategory::Created, handler).unwrap();

        h.create("trigger.txt");

        assert!(!h.session.is_open());
        assert!(seen.lock().is_empty());
        assert_eq!(h.release.calls.load(Ordering::SeqCst), 1);
        assert!(h.release.from_callback.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_closes_session() {
        let h = Harness::open("");
        let Harness {
            session,
            feed,
            release,
            _dir,
        } = h;
        drop(session);

        assert_eq!(release.calls.load(Ordering::SeqCst), 1);
        assert!(!feed.registry.is_open());
        assert!(!release.from_callback.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dropped_event_stream_unsubscribes() {
        let h = Harness::open("");
        for _ in 0..100 {
            drop(h.session.event_stream().unwrap());
        }

        for stream in Stream::ALL {
            assert_eq!(h.session.shared.registry.len(stream), 0);
        }
    }

    #[test]
    fn test_close_flushes_unpaired_rename() {
        let h = Harness::open("*.log");
        let (handler, seen) = recorder();
        subscribe_all(&h.session, &handler);

        h.send(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path(h.path("a.log"))
                .set_tracker(21),
        );
        h.session.close();

        assert_eq!(
            *seen.lock(),
            vec![WatchEvent::Deleted {
                path: h.path("a.log"),
                name: "a.log".to_string(),
            }]
        );
        assert_eq!(h.session.stats().deleted, 1);
    }

    #[test]
    fn test_rename_timer_expires_unpaired_from() {
        let h = Harness::open("*.log");
        let (handler, seen) = recorder();
        h.session.on(EventCategory::Deleted, handler).unwrap();

        h.send(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path(h.path("gone.log"))
                .set_tracker(22),
        );
        std::thread::sleep(RENAME_PAIR_TIMEOUT + TICK_INTERVAL * 5);

        assert_eq!(
            *seen.lock(),
            vec![WatchEvent::Deleted {
                path: h.path("gone.log"),
                name: "gone.log".to_string(),
            }]
        );
        assert!(h.session.is_open());
    }

    #[tokio::test]
    async fn test_event_stream_receives_events() {
        let h = Harness::open("*.log");
        let mut rx = h.session.event_stream().unwrap();

        h.create("a.log");
        h.remove("a.log");
        h.session.close();

        assert_eq!(
            rx.recv().await,
            Some(WatchEvent::Created {
                path: h.path("a.log"),
                name: "a.log".to_string(),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(WatchEvent::Deleted {
                path: h.path("a.log"),
                name: "a.log".to_string(),
            })
        );
        assert_eq!(rx.recv().await, None);
    }
}
