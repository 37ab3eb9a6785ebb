//! Lifecycle events and a synchronous subscriber registry.
//!
//! Handlers are registered per [`EventKind`] and invoked in subscription
//! order on the thread that emits the event. A handler that returns an
//! error or panics is logged and skipped; it never aborts the run.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::diagnostics::{StageMetrics, StageTimings};
use crate::output::RestorationReport;
use crate::pipeline::StageId;

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A stage is about to run.
    StageStart {
        /// The stage.
        stage: StageId,
    },
    /// Stage-local progress, throttled by the configured interval.
    StageProgress {
        /// The stage.
        stage: StageId,
        /// Stage-local percentage, 0–100.
        percent: f64,
        /// Short description of the current step.
        message: String,
    },
    /// A stage finished.
    StageComplete {
        /// The stage.
        stage: StageId,
        /// Wall-clock time the stage took.
        duration: Duration,
        /// What the stage produced.
        metrics: StageMetrics,
    },
    /// A stage failed. Followed by [`PipelineEvent::PipelineError`].
    StageError {
        /// The stage.
        stage: StageId,
        /// Rendered error.
        error: String,
    },
    /// The run produced a restored image.
    PipelineComplete {
        /// The restoration report.
        report: RestorationReport,
        /// Per-stage timings.
        timings: StageTimings,
    },
    /// The run failed.
    PipelineError {
        /// Rendered error.
        error: String,
        /// The failing stage, when one is known.
        stage: Option<StageId>,
    },
    /// The run was cancelled at a stage boundary.
    PipelineCancel,
    /// The run was paused.
    Paused,
    /// The run was resumed.
    Resumed,
}

/// Discriminant of [`PipelineEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    StageStart,
    StageProgress,
    StageComplete,
    StageError,
    PipelineComplete,
    PipelineError,
    PipelineCancel,
    Paused,
    Resumed,
}

impl EventKind {
    /// Every kind.
    pub const ALL: [Self; 9] = [
        Self::StageStart,
        Self::StageProgress,
        Self::StageComplete,
        Self::StageError,
        Self::PipelineComplete,
        Self::PipelineError,
        Self::PipelineCancel,
        Self::Paused,
        Self::Resumed,
    ];

    /// Kebab-case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::StageStart => "stage-start",
            Self::StageProgress => "stage-progress",
            Self::StageComplete => "stage-complete",
            Self::StageError => "stage-error",
            Self::PipelineComplete => "pipeline-complete",
            Self::PipelineError => "pipeline-error",
            Self::PipelineCancel => "pipeline-cancel",
            Self::Paused => "pipeline-paused",
            Self::Resumed => "pipeline-resumed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl PipelineEvent {
    /// The event's kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StageStart { .. } => EventKind::StageStart,
            Self::StageProgress { .. } => EventKind::StageProgress,
            Self::StageComplete { .. } => EventKind::StageComplete,
            Self::StageError { .. } => EventKind::StageError,
            Self::PipelineComplete { .. } => EventKind::PipelineComplete,
            Self::PipelineError { .. } => EventKind::PipelineError,
            Self::PipelineCancel => EventKind::PipelineCancel,
            Self::Paused => EventKind::Paused,
            Self::Resumed => EventKind::Resumed,
        }
    }
}

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A subscribed callback.
pub type Handler = Arc<dyn Fn(&PipelineEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next: u64,
    handlers: BTreeMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

/// Subscriber registry with synchronous dispatch.
///
/// The registry lock is released before handlers run, so a handler may
/// subscribe, unsubscribe, or call back into the controller.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        let counts: BTreeMap<EventKind, usize> = registry
            .handlers
            .iter()
            .map(|(k, v)| (*k, v.len()))
            .collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

impl EventBus {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = SubscriptionId(registry.next);
        registry.next += 1;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let mut removed = false;
        for list in registry.handlers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler subscribed to its kind.
    pub fn emit(&self, event: &PipelineEvent) {
        let kind = event.kind();
        let handlers: Vec<(SubscriptionId, Handler)> =
            self.lock().handlers.get(&kind).cloned().unwrap_or_default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event = %kind, subscription = id.0, error = %e, "event handler failed");
                }
                Err(_) => {
                    tracing::warn!(event = %kind, subscription = id.0, "event handler panicked");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter(bus: &EventBus, kind: EventKind) -> (SubscriptionId, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(kind, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (id, count)
    }

    #[test]
    fn delivers_only_matching_kind() {
        let bus = EventBus::new();
        let (_, paused) = counter(&bus, EventKind::Paused);
        let (_, resumed) = counter(&bus, EventKind::Resumed);
        bus.emit(&PipelineEvent::Paused);
        bus.emit(&PipelineEvent::Paused);
        assert_eq!(paused.load(Ordering::SeqCst), 2);
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, count) = counter(&bus, EventKind::PipelineCancel);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&PipelineEvent::PipelineCancel);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(EventKind::PipelineCancel), 0);
    }

    #[test]
    fn failing_handlers_do_not_stop_others() {
        let bus = EventBus::new();
        bus.subscribe(EventKind::StageStart, |_| Err("boom".into()));
        bus.subscribe(EventKind::StageStart, |_| panic!("handler panic"));
        let (_, count) = counter(&bus, EventKind::StageStart);
        bus.emit(&PipelineEvent::StageStart {
            stage: StageId::Detection,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_subscribe_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe(EventKind::Resumed, move |_| {
            inner.subscribe(EventKind::Paused, |_| Ok(()));
            Ok(())
        });
        bus.emit(&PipelineEvent::Resumed);
        assert_eq!(bus.subscriber_count(EventKind::Paused), 1);
    }

    #[test]
    fn kinds_have_distinct_names() {
        let mut names: Vec<&str> = EventKind::ALL.iter().map(|k| k.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EventKind::ALL.len());
    }
}
