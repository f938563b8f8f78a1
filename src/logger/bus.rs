use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::LogLevel;

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
}

/// Receiver of published log events. Called from whichever task produced the
/// event, so implementations must be thread-safe.
pub trait LogSink: Send + Sync {
    fn on_event(&self, event: &LogEvent);
}

impl<F> LogSink for F
where
    F: Fn(&LogEvent) + Send + Sync,
{
    fn on_event(&self, event: &LogEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<(SubscriptionId, Arc<dyn LogSink>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn LogSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.write().push((id, sink));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        sinks.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn publish(&self, event: &LogEvent) {
        // Clone the list so a sink may (un)subscribe from inside its callback.
        let sinks: Vec<Arc<dyn LogSink>> = self.sinks.read().iter().map(|(_, s)| s.clone()).collect();
        for sink in sinks {
            sink.on_event(event);
        }
    }
}
