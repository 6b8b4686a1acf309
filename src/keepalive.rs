//! Background keep-alive sweeper
//!
//! A recurring task that probes idle pooled connections so server-side idle
//! timeouts never turn into a burst of synchronous reconnects during a
//! traffic spike. Nothing waits on it; the pool's sweep swallows every
//! per-connection failure, so one bad session never stops the rest from
//! being probed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;

/// Handle to the spawned keep-alive task
///
/// Dropping the handle cancels the task; [`KeepAliveSweeper::shutdown`]
/// cancels and waits for it to finish.
pub struct KeepAliveSweeper {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl KeepAliveSweeper {
    /// Spawn the sweeper against a shared pool
    ///
    /// The first sweep runs immediately, then once per `period`. A sweep
    /// that overruns the period delays the next tick rather than bunching
    /// probes together.
    pub fn spawn(pool: Arc<ConnectionPool>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::debug!("keep-alive sweep starting");
                        pool.sweep_idle().await;
                    }
                }
            }
            tracing::debug!("keep-alive sweeper stopped");
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Cancel the sweeper and wait for it to wind down
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for KeepAliveSweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
