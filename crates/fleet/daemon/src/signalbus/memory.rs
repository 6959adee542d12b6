//! In-process signal bus

use super::{SignalBus, SignalRegistry, Subscription};
use std::sync::Arc;

/// Signal bus reaching subscribers of this process only
#[derive(Debug, Clone, Default)]
pub struct InMemorySignalBus {
    registry: Arc<SignalRegistry>,
}

impl InMemorySignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise every signal that currently has subscribers
    pub fn notify_all(&self) {
        self.registry.raise_all();
    }
}

impl SignalBus for InMemorySignalBus {
    fn notify(&self, name: &str) {
        if !self.registry.raise(name) {
            tracing::trace!(signal = name, "No subscribers for signal");
        }
    }

    fn subscribe(&self, name: &str) -> Subscription {
        self.registry.subscribe(name)
    }
}
