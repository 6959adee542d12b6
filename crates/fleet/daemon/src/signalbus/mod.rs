//! Named wake-up signals
//!
//! Reconcilers subscribe to `reconcile:{worker_type}` and are woken early
//! when a peer commits a change relevant to them. Signals are level
//! triggered: a notification with nobody waiting stays latched until the
//! next wait consumes it, so a wake-up is never lost, only coalesced.
//!
//! The in-memory bus only reaches subscribers in this process. The
//! PostgreSQL bus broadcasts every notification through `pg_notify` so that
//! all control-plane replicas, the sender included, receive it.

mod memory;
mod postgres;

pub use memory::InMemorySignalBus;
pub use postgres::PgSignalBus;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Worker types, each woken by its `reconcile:{type}` signal
pub mod worker_type {
    pub const CONNECTOR: &str = "connector";
    pub const PROCESSOR: &str = "processor";
    pub const CONNECTOR_TYPE: &str = "connector_type";
    pub const PROCESSOR_TYPE: &str = "processor_type";
    pub const CONNECTOR_CLUSTER: &str = "connector_cluster";
    pub const CONNECTOR_NAMESPACE: &str = "connector_namespace";
}

/// Signal name used to wake the reconciler of `worker_type`
pub fn reconcile_signal(worker_type: &str) -> String {
    format!("reconcile:{worker_type}")
}

/// Signal name the agent of `cluster_id` watches for deployment changes
pub fn cluster_deployments_signal(cluster_id: &impl std::fmt::Display) -> String {
    format!("/kafka-connector-clusters/{cluster_id}/deployments")
}

/// Publish/subscribe keyed by signal name
pub trait SignalBus: Send + Sync {
    /// Raise `name`. Never blocks, whether or not anyone subscribed.
    fn notify(&self, name: &str);

    /// Subscribe to `name`
    fn subscribe(&self, name: &str) -> Subscription;
}

#[derive(Debug, Default)]
struct Signal {
    pending: AtomicBool,
    notify: Notify,
}

impl Signal {
    fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
struct SharedSignal {
    signal: Arc<Signal>,
    subscribers: usize,
}

/// Signals by name, reference counted by live subscriptions
#[derive(Debug, Default)]
pub(crate) struct SignalRegistry {
    signals: DashMap<String, SharedSignal>,
}

impl SignalRegistry {
    pub(crate) fn raise(&self, name: &str) -> bool {
        match self.signals.get(name) {
            Some(shared) => {
                shared.signal.raise();
                true
            }
            None => false,
        }
    }

    pub(crate) fn raise_all(&self) {
        for shared in self.signals.iter() {
            shared.signal.raise();
        }
    }

    pub(crate) fn subscribe(self: &Arc<Self>, name: &str) -> Subscription {
        let signal = {
            let mut shared = self
                .signals
                .entry(name.to_string())
                .or_insert_with(|| SharedSignal {
                    signal: Arc::new(Signal::default()),
                    subscribers: 0,
                });
            shared.subscribers += 1;
            shared.signal.clone()
        };

        Subscription {
            name: name.to_string(),
            signal,
            registry: Some(self.clone()),
        }
    }

    fn release(&self, name: &str) {
        if let Entry::Occupied(mut shared) = self.signals.entry(name.to_string()) {
            shared.get_mut().subscribers -= 1;
            if shared.get().subscribers == 0 {
                shared.remove();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.signals.len()
    }
}

/// A handle on a named signal. Subscriptions to the same name share one
/// latch; the latch is released once the last of them is closed or dropped.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    signal: Arc<Signal>,
    registry: Option<Arc<SignalRegistry>>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume the latch if it is set
    pub fn is_signaled(&self) -> bool {
        self.signal.take()
    }

    /// Wait until the signal is raised, consuming the latch
    pub async fn signaled(&self) {
        loop {
            let notified = self.signal.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.signal.take() {
                return;
            }
            notified.await;
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.release(&self.name);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
