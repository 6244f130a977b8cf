//! Background workers: one timer-driven cycle loop per store.
//!
//! A semaphore bounds how many cycles run at once. Cycles are blocking and
//! run on tokio's blocking pool; a store's loop awaits its cycle before the
//! next tick, so a store never has two cycles in flight.

use crate::config::NodeConfig;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::repository::LocalRepository;
use crate::transport::BatchTransport;
use std::sync::Arc;
use std::time::Duration;
use tillsync_protocol::StoreId;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// A pool of per-store sync loops.
pub struct SyncWorkerPool {
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    workers: Vec<(StoreId, JoinHandle<()>)>,
}

impl SyncWorkerPool {
    /// Creates a pool running at most `concurrency` cycles at once.
    pub fn new(concurrency: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            shutdown,
            workers: Vec::new(),
        }
    }

    /// Creates a pool sized by [`NodeConfig::workers`].
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.workers)
    }

    /// Returns the stores with a running loop.
    pub fn stores(&self) -> Vec<StoreId> {
        self.workers.iter().map(|(id, _)| *id).collect()
    }

    /// Starts the cycle loop of `engine`.
    ///
    /// The loop ticks every `sync_interval_seconds` of the store's
    /// configuration; the first cycle runs at once when
    /// `auto_sync_on_startup` is set. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` if the store already has a loop in this
    /// pool.
    pub fn spawn<T, R>(&mut self, engine: Arc<SyncEngine<T, R>>) -> SyncResult<()>
    where
        T: BatchTransport + 'static,
        R: LocalRepository + 'static,
    {
        let store_id = engine.store_id();
        if self.workers.iter().any(|(id, _)| *id == store_id) {
            return Err(SyncError::Config(format!("{store_id} already has a sync worker")));
        }
        let config = engine.node().configuration(store_id)?;
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(run_loop(
            engine,
            permits,
            shutdown,
            config.sync_interval(),
            config.auto_sync_on_startup,
        ));
        info!(store = %store_id, interval_s = config.sync_interval_seconds, "sync worker started");
        self.workers.push((store_id, handle));
        Ok(())
    }

    /// Stops every loop, cancelling running cycles at their next record
    /// boundary, and waits for them to exit.
    pub async fn shutdown(self) {
        // Receivers are held by the loops; a send error only means they exited.
        let _ = self.shutdown.send(true);
        for (store_id, handle) in self.workers {
            if let Err(e) = handle.await {
                error!(store = %store_id, error = %e, "sync worker ended abnormally");
            }
        }
        info!("sync workers stopped");
    }
}

async fn run_loop<T, R>(
    engine: Arc<SyncEngine<T, R>>,
    permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
    run_at_start: bool,
) where
    T: BatchTransport + 'static,
    R: LocalRepository + 'static,
{
    let store_id = engine.store_id();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !run_at_start {
        // The first tick completes immediately.
        ticker.tick().await;
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let cycle_engine = Arc::clone(&engine);
        let mut cycle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            cycle_engine.sync()
        });
        let joined = tokio::select! {
            joined = &mut cycle => joined,
            _ = shutdown.changed() => {
                engine.cancel();
                let joined = cycle.await;
                log_cycle(store_id, joined);
                break;
            }
        };
        log_cycle(store_id, joined);
    }
    debug!(store = %store_id, "sync worker exiting");
}

fn log_cycle(
    store_id: StoreId,
    joined: Result<SyncResult<crate::engine::SyncCycleResult>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(result)) if result.skipped => {
            debug!(store = %store_id, "sync disabled, cycle skipped");
        }
        Ok(Ok(result)) => {
            debug!(store = %store_id, sent = result.batches_sent, received = result.batches_received, "cycle done");
        }
        // Already logged by the engine.
        Ok(Err(_)) => {}
        Err(e) => error!(store = %store_id, error = %e, "sync cycle panicked"),
    }
}
