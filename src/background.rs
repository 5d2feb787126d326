//! Background task registry for periodic maintenance work.
//!
//! Maintenance loops (leak reporting, idle scope collection, cache eviction,
//! session sweeping) register here so graceful shutdown can stop them and
//! wait for the in-flight pass to finish before the process exits.

// std::sync::Mutex is correct here—lock is never held across .await points.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// ============================================================================
// BackgroundTasks
// ============================================================================

/// Registry of spawned tasks that are awaited on shutdown.
#[derive(Clone)]
pub struct BackgroundTasks {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx,
        }
    }

    /// Spawn a task and register its handle.
    ///
    /// Registration is synchronous so the handle is tracked before this
    /// method returns, even for tasks that complete immediately.
    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);

        let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        guard.retain(|h| !h.is_finished());
        guard.push(handle);
    }

    /// Spawn a loop that runs `tick` every `period` until shutdown.
    ///
    /// A tick already in progress when shutdown is signalled runs to
    /// completion; `shutdown()` waits for it.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        self.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it so the loop
            // starts one full period after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    _ = shutdown.changed() => {
                        debug!(task = name, "Periodic task stopping");
                        break;
                    }
                }
            }
        });
    }

    /// Signal periodic tasks to stop, then wait for every registered task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        let count = handles.len();
        if count == 0 {
            return;
        }

        info!(count, "Waiting for background tasks to complete");
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(()) => {}
                Err(e) => {
                    warn!(task = i, error = %e, "Background task panicked");
                }
            }
        }
        info!("All background tasks completed");
    }

    pub fn pending_count(&self) -> usize {
        let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        guard.retain(|h| !h.is_finished());
        guard.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
