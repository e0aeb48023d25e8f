//! Background drain loop for the outbox.

use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::outbox::Outbox;

struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the periodic drain task of one outbox.
pub(crate) struct Processor {
    handle: Mutex<Option<ProcessorHandle>>,
}

impl Processor {
    pub(crate) fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    /// Spawn the drain loop. Returns false if one is already running.
    pub(crate) async fn start(&self, outbox: Weak<Outbox>, period: Duration) -> bool {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(outbox, period, shutdown_rx));
        *handle = Some(ProcessorHandle { shutdown, task });
        true
    }

    /// Signal the loop to stop and wait for it. Returns false if it was not
    /// running.
    pub(crate) async fn stop(&self) -> bool {
        let Some(handle) = self.handle.lock().await.take() else {
            return false;
        };

        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            warn!("Outbox processor ended abnormally: {}", e);
        }
        true
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }
}

fn new_ticker(period: Duration, immediate: bool) -> Interval {
    let mut ticker = if immediate {
        interval(period)
    } else {
        interval_at(Instant::now() + period, period)
    };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Drain on every tick until shutdown is signalled or the outbox is dropped.
async fn run(outbox: Weak<Outbox>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = new_ticker(period, true);
    info!("Outbox processor started (interval {:?})", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(outbox) = outbox.upgrade() else {
                    debug!("Outbox dropped, processor exiting");
                    break;
                };
                outbox.trigger_sync().await;

                // Pick up interval changes from reconfigure.
                let current = outbox.config().sync_interval;
                if current != ticker.period() {
                    debug!("Processor interval changed to {:?}", current);
                    ticker = new_ticker(current, false);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Outbox processor stopped");
}
