//! Reconcile workers
//!
//! Each manager is a [`Reconciler`] driven by a [`Worker`]: one background
//! task that reconciles on a fixed interval, whenever its
//! `reconcile:{worker_type}` signal is raised, and stops on request.
//! Errors returned by a tick are logged and the loop carries on.

mod cluster_mgr;
mod connector_mgr;
mod namespace_mgr;
mod processor_mgr;
mod readiness;
mod type_mgr;

pub use cluster_mgr::ClusterManager;
pub use connector_mgr::ConnectorManager;
pub use namespace_mgr::NamespaceManager;
pub use processor_mgr::ProcessorManager;
pub use readiness::ReadinessGate;
pub use type_mgr::CatalogTypeManager;

use crate::error::FleetError;
use crate::signalbus::{reconcile_signal, SignalBus};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Convergence logic of one manager
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Names the `reconcile:{worker_type}` signal that wakes this reconciler
    fn worker_type(&self) -> &'static str;

    /// One tick. Row failures are returned, never raised.
    async fn reconcile(&self) -> Vec<FleetError>;

    /// When true after a tick, the loop exits for good
    fn has_terminated(&self) -> bool {
        false
    }
}

/// Runs a [`Reconciler`] in a background task
pub struct Worker<R> {
    id: String,
    reconciler: Arc<R>,
    signals: Arc<dyn SignalBus>,
    interval: Duration,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Reconciler> Worker<R> {
    pub fn new(reconciler: Arc<R>, signals: Arc<dyn SignalBus>, interval: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4().to_string(),
            reconciler,
            signals,
            interval,
            running: AtomicBool::new(false),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    pub fn worker_type(&self) -> &'static str {
        self.reconciler.worker_type()
    }

    /// Spawn the reconcile loop. Calling it again while running does nothing.
    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.stop_tx.send_replace(false);
        let stop_rx = self.stop_tx.subscribe();
        // Subscribe before spawning so a signal raised right after start is latched
        let subscription = self
            .signals
            .subscribe(&reconcile_signal(self.reconciler.worker_type()));

        let handle = tokio::spawn(run_loop(
            self.id.clone(),
            self.reconciler.clone(),
            subscription,
            self.interval,
            stop_rx,
        ));
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(worker_id = %self.id, worker_type = self.worker_type(), "Worker started");
    }

    /// Stop the loop and wait for it to exit. An in-flight tick finishes
    /// first. Idempotent.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(worker_id = %self.id, error = %e, "Worker task failed");
            }
            info!(worker_id = %self.id, worker_type = self.worker_type(), "Worker stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn run_loop<R: Reconciler>(
    id: String,
    reconciler: Arc<R>,
    subscription: crate::signalbus::Subscription,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let worker_type = reconciler.worker_type();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
            _ = subscription.signaled() => {
                debug!(worker_id = %id, worker_type, "Woken by signal");
            }
        }

        let errors = reconciler.reconcile().await;
        for e in &errors {
            error!(worker_id = %id, worker_type, error = %e, "Reconcile error");
        }

        if reconciler.has_terminated() {
            info!(worker_id = %id, worker_type, "Worker terminated");
            break;
        }
    }
    subscription.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signalbus::InMemorySignalBus;
    use std::sync::atomic::AtomicUsize;

    struct CountingReconciler {
        ticks: AtomicUsize,
        terminate_after: Option<usize>,
    }

    impl CountingReconciler {
        fn new(terminate_after: Option<usize>) -> Self {
            Self {
                ticks: AtomicUsize::new(0),
                terminate_after,
            }
        }

        fn ticks(&self) -> usize {
            self.ticks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        fn worker_type(&self) -> &'static str {
            "counting"
        }

        async fn reconcile(&self) -> Vec<FleetError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            vec![FleetError::Internal("row failed".into())]
        }

        fn has_terminated(&self) -> bool {
            self.terminate_after.is_some_and(|n| self.ticks() >= n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval_despite_errors() {
        let bus = InMemorySignalBus::new();
        let reconciler = Arc::new(CountingReconciler::new(None));
        let worker = Worker::new(reconciler.clone(), Arc::new(bus), Duration::from_secs(30));

        worker.start();
        // First tick fires immediately, then every 30s
        tokio::time::sleep(Duration::from_secs(65)).await;
        worker.stop().await;

        assert_eq!(reconciler.ticks(), 3);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_wakes_worker_early() {
        let bus = InMemorySignalBus::new();
        let reconciler = Arc::new(CountingReconciler::new(None));
        let worker = Worker::new(
            reconciler.clone(),
            Arc::new(bus.clone()),
            Duration::from_secs(3600),
        );

        worker.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.ticks(), 1);

        bus.notify("reconcile:counting");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.ticks(), 2);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_joins() {
        let bus = InMemorySignalBus::new();
        let reconciler = Arc::new(CountingReconciler::new(None));
        let worker = Worker::new(reconciler.clone(), Arc::new(bus), Duration::from_secs(3600));

        worker.start();
        worker.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.ticks(), 1);

        worker.stop().await;
        worker.stop().await;
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(reconciler.ticks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminated_worker_exits() {
        let bus = InMemorySignalBus::new();
        let reconciler = Arc::new(CountingReconciler::new(Some(2)));
        let worker = Worker::new(reconciler.clone(), Arc::new(bus), Duration::from_secs(10));

        worker.start();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(reconciler.ticks(), 2);
        worker.stop().await;
    }
}
