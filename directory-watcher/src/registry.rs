//! Thread-safe listener registry.
//!
//! One mutex guards every stream of a session. Dispatch never holds the
//! lock while a handler runs, so handlers may subscribe, unsubscribe or
//! close the session from inside a callback.
//!
//! Removal is immediate for the delivering thread: a handler removed by an
//! earlier handler of the same event is skipped. A removal made on another
//! thread can race the re-check, so a handler may run once more if its
//! dispatch had already passed that check.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, WatcherError};
use crate::event::{EventCategory, WatchEvent};

/// A caller-supplied event handler.
///
/// Identity is the `Arc` allocation: registering the same `Arc` twice yields
/// two invocations per event, and `off` removes one of them.
pub type Handler = Arc<dyn Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync>;

/// A stream handlers can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Category(EventCategory),
    Errors,
}

impl Stream {
    const COUNT: usize = 5;

    pub(crate) const ALL: [Self; Self::COUNT] = [
        Self::Category(EventCategory::Created),
        Self::Category(EventCategory::Changed),
        Self::Category(EventCategory::Deleted),
        Self::Category(EventCategory::Renamed),
        Self::Errors,
    ];

    fn index(self) -> usize {
        match self {
            Self::Category(EventCategory::Created) => 0,
            Self::Category(EventCategory::Changed) => 1,
            Self::Category(EventCategory::Deleted) => 2,
            Self::Category(EventCategory::Renamed) => 3,
            Self::Errors => 4,
        }
    }
}

struct Registration {
    id: u64,
    handler: Handler,
}

struct RegistryState {
    open: bool,
    next_id: u64,
    streams: [Vec<Registration>; Stream::COUNT],
}

/// Result of delivering one event.
#[derive(Debug, Default)]
pub(crate) struct DispatchReport {
    /// Handlers that ran to completion.
    pub(crate) invoked: usize,
    /// Messages of handlers that failed or panicked.
    pub(crate) faults: Vec<String>,
}

/// Per-session handler storage.
pub(crate) struct ListenerRegistry {
    state: Mutex<RegistryState>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                open: true,
                next_id: 0,
                streams: Default::default(),
            }),
        }
    }

    /// Append a registration.
    pub(crate) fn add(&self, stream: Stream, handler: Handler) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(WatcherError::SessionClosed);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.streams[stream.index()].push(Registration { id, handler });
        Ok(())
    }

    /// Remove the most recent registration of `handler`.
    ///
    /// Returns whether one was found.
    pub(crate) fn remove(&self, stream: Stream, handler: &Handler) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(WatcherError::SessionClosed);
        }
        let registrations = &mut state.streams[stream.index()];
        match registrations
            .iter()
            .rposition(|r| Arc::ptr_eq(&r.handler, handler))
        {
            Some(position) => {
                registrations.remove(position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of registrations on a stream.
    #[cfg(test)]
    pub(crate) fn len(&self, stream: Stream) -> usize {
        self.state.lock().streams[stream.index()].len()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Stop all delivery and drop every registration.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        state.open = false;
        for registrations in &mut state.streams {
            registrations.clear();
        }
        true
    }

    /// Invoke every handler registered on `stream`, in registration order.
    ///
    /// Each handler is re-checked right before it runs so one removed (or a
    /// session closed) by an earlier handler is skipped.
    pub(crate) fn dispatch(&self, stream: Stream, event: &WatchEvent) -> DispatchReport {
        let snapshot: Vec<(u64, Handler)> = {
            let state = self.state.lock();
            if !state.open {
                return DispatchReport::default();
            }
            state.streams[stream.index()]
                .iter()
                .map(|r| (r.id, Arc::clone(&r.handler)))
                .collect()
        };

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            if !self.is_registered(stream, id) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => report.invoked += 1,
                Ok(Err(err)) => report.faults.push(format!("{err:#}")),
                Err(payload) => report.faults.push(panic_message(payload.as_ref())),
            }
        }
        report
    }

    fn is_registered(&self, stream: Stream, id: u64) -> bool {
        let state = self.state.lock();
        state.open && state.streams[stream.index()].iter().any(|r| r.id == id)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
