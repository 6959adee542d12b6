//! Signal bus shared by all replicas through PostgreSQL LISTEN/NOTIFY

use super::{InMemorySignalBus, SignalBus, Subscription};
use crate::config::SignalBusConfig;
use crate::error::{FleetError, FleetResult};
use sqlx::postgres::{PgListener, PgPool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Broadcasts every notification with `pg_notify` and dispatches what the
/// listener receives to local subscribers. The sender receives its own
/// notifications back through the listener.
pub struct PgSignalBus {
    pool: PgPool,
    config: SignalBusConfig,
    local: InMemorySignalBus,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PgSignalBus {
    pub fn new(pool: PgPool, config: SignalBusConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            pool,
            config,
            local: InMemorySignalBus::new(),
            running: AtomicBool::new(false),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Start the background listener. Calling it again while running does nothing.
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
        let handle = tokio::spawn(run_listener(
            self.pool.clone(),
            self.config.clone(),
            self.local.clone(),
            stop_rx,
        ));

        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(channel = %self.config.channel, "Signal bus listener started");
    }

    /// Stop the listener and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Signal bus listener task failed");
            }
            info!(channel = %self.config.channel, "Signal bus listener stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl SignalBus for PgSignalBus {
    fn notify(&self, name: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(signal = name, "No runtime to broadcast signal, notifying locally");
            self.local.notify(name);
            return;
        };

        let pool = self.pool.clone();
        let channel = self.config.channel.clone();
        let local = self.local.clone();
        let name = name.to_string();
        runtime.spawn(async move {
            let sent = sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&channel)
                .bind(&name)
                .execute(&pool)
                .await;
            if let Err(e) = sent {
                warn!(signal = %name, error = %e, "Failed to broadcast signal, notifying locally");
                local.notify(&name);
            }
        });
    }

    fn subscribe(&self, name: &str) -> Subscription {
        self.local.subscribe(name)
    }
}

/// Resolves once stop is requested or the bus is dropped
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// True if stop was requested before `delay` elapsed
async fn stopped_within(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = stop_requested(stop_rx) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn run_listener(
    pool: PgPool,
    config: SignalBusConfig,
    local: InMemorySignalBus,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut lost = false;

    loop {
        let Some(mut listener) = connect(&pool, &config, &mut stop_rx, &mut lost).await else {
            return;
        };

        if lost {
            // Notifications sent while disconnected are gone; wake everyone.
            local.notify_all();
        }

        match receive(&mut listener, &config, &local, &mut stop_rx).await {
            Ok(()) => return,
            Err(e) => {
                error!(error = %e, "Signal bus listener failed");
                lost = true;
                if stopped_within(&mut stop_rx, config.restart_delay()).await {
                    return;
                }
            }
        }
    }
}

/// Connect and LISTEN, backing off between attempts. `None` once stopped.
async fn connect(
    pool: &PgPool,
    config: &SignalBusConfig,
    stop_rx: &mut watch::Receiver<bool>,
    lost: &mut bool,
) -> Option<PgListener> {
    let mut delay = config.reconnect_min();

    loop {
        if *stop_rx.borrow() {
            return None;
        }

        let attempt = async {
            let mut listener = PgListener::connect_with(pool).await?;
            listener.listen(&config.channel).await?;
            Ok::<_, sqlx::Error>(listener)
        };

        match attempt.await {
            Ok(listener) => {
                debug!(channel = %config.channel, "Signal bus listener connected");
                return Some(listener);
            }
            Err(e) => {
                *lost = true;
                warn!(error = %e, retry_in = ?delay, "Signal bus listener could not connect");
                if stopped_within(stop_rx, delay).await {
                    return None;
                }
                delay = (delay * 2).min(config.reconnect_max());
            }
        }
    }
}

/// Dispatch notifications until stopped or the connection is lost
async fn receive(
    listener: &mut PgListener,
    config: &SignalBusConfig,
    local: &InMemorySignalBus,
    stop_rx: &mut watch::Receiver<bool>,
) -> FleetResult<()> {
    loop {
        tokio::select! {
            _ = stop_requested(stop_rx) => return Ok(()),
            received = tokio::time::timeout(config.ping_after(), listener.try_recv()) => {
                match received {
                    Ok(Ok(Some(notification))) => local.notify(notification.payload()),
                    Ok(Ok(None)) => {
                        return Err(FleetError::SignalBus("listener connection lost".into()));
                    }
                    Ok(Err(e)) => return Err(FleetError::SignalBus(e.to_string())),
                    Err(_) => {
                        debug!("No signal received recently, pinging connection");
                        sqlx::query("SELECT 1")
                            .execute(&mut *listener)
                            .await
                            .map_err(|e| FleetError::SignalBus(format!("ping failed: {e}")))?;
                    }
                }
            }
        }
    }
}
