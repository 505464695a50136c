use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::models::{ConsoleLevel, ServerEvent};

/// Fan-out of controller events to any number of observers.
///
/// Each subscriber gets its own unbounded stream, so a slow console never
/// drops lines and never blocks the process readers. Closed subscribers are
/// pruned on the next emit.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<ServerEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: ServerEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Emits a console line and mirrors it into the tracing log.
    pub fn console(&self, profile_id: &str, level: ConsoleLevel, line: impl Into<String>) {
        let line = line.into();
        match level {
            ConsoleLevel::Warning => tracing::warn!(profile_id, "{}", line),
            ConsoleLevel::Error => tracing::error!(profile_id, "{}", line),
            ConsoleLevel::Info => tracing::info!(profile_id, "{}", line),
            ConsoleLevel::Stdout | ConsoleLevel::Stderr => {
                tracing::trace!(profile_id, "{}", line)
            }
        }
        self.emit(ServerEvent::log(profile_id, level, line));
    }

    pub fn state(&self, profile_id: &str, is_running: bool) {
        self.emit(ServerEvent::state(profile_id, is_running));
    }

    /// Drops every subscriber. Their streams end once they have drained what
    /// was already sent.
    pub fn close(&self) {
        self.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UnboundedSender<ServerEvent>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
