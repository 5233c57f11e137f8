//! Start/shutdown lifecycle shared by the background services.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::error;

use keel_core::Result;

/// Handle to a running background service.
pub struct ServiceHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    pub(crate) fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Run `tick` every `every` until shutdown. The first tick fires after one period.
    pub(crate) fn spawn_interval<F, Fut>(&mut self, every: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
        }));
    }

    /// Number of interval tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Signal every task and wait for the current ticks to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(service = self.name, error = %e, "Service task failed");
            }
        }
        Ok(())
    }
}
