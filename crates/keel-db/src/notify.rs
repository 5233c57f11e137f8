//! PostgreSQL LISTEN/NOTIFY transport for dispatcher events.
//!
//! Writers call [`notify`] on the connection of their open transaction, so the
//! notification is delivered only if the transaction commits. A
//! [`NotificationListener`] holds one dedicated connection that LISTENs on
//! every event channel and forwards decoded events to a [`Dispatcher`].

use std::time::Instant;

use sqlx::postgres::{PgListener, PgPool};
use sqlx::PgConnection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use keel_core::{Dispatcher, Error, Event, EventKind, Result};

/// Queue `event` on the channel named after its kind.
pub async fn notify(conn: &mut PgConnection, event: &Event) -> Result<()> {
    let payload = event.payload()?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(event.kind().channel())
        .bind(&payload)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?;

    trace!(
        subsystem = "db",
        component = "notify",
        event_kind = %event.kind(),
        payload_len = payload.len(),
        "Queued notification"
    );
    Ok(())
}

/// Handle to a running listener task.
pub struct ListenerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop listening and wait for the task to exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Listener task failed: {}", e)))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Bridges PostgreSQL notifications into a local dispatcher.
pub struct NotificationListener {
    pool: PgPool,
    dispatcher: Dispatcher,
    kinds: Vec<EventKind>,
}

impl NotificationListener {
    /// Listen on all four event channels.
    pub fn new(pool: PgPool, dispatcher: Dispatcher) -> Self {
        Self {
            pool,
            dispatcher,
            kinds: EventKind::ALL.to_vec(),
        }
    }

    /// Restrict the channels this listener subscribes to.
    pub fn with_kinds(mut self, kinds: &[EventKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// Connect, LISTEN, and spawn the forwarding loop.
    ///
    /// Connection failures after startup are retried by sqlx on the next
    /// receive; notifications sent while disconnected are lost, which the
    /// workers' poll interval covers.
    pub async fn start(self) -> Result<ListenerHandle> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(Error::Database)?;
        let channels: Vec<&str> = self.kinds.iter().map(|k| k.channel()).collect();
        listener
            .listen_all(channels.iter().copied())
            .await
            .map_err(Error::Database)?;

        info!(
            subsystem = "dispatcher",
            component = "listener",
            channels = ?channels,
            "Notification listener started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = self.dispatcher;
        let task = tokio::spawn(async move {
            Self::run(listener, dispatcher, shutdown_rx).await;
        });

        Ok(ListenerHandle { shutdown_tx, task })
    }

    #[instrument(skip_all, fields(subsystem = "dispatcher", component = "listener"))]
    async fn run(
        mut listener: PgListener,
        dispatcher: Dispatcher,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Notification listener shutting down");
                    break;
                }
                received = listener.recv() => {
                    match received {
                        Ok(notification) => {
                            let start = Instant::now();
                            match Event::decode(notification.channel(), notification.payload()) {
                                Ok(event) => {
                                    let delivered = dispatcher.publish(event);
                                    trace!(
                                        event_kind = notification.channel(),
                                        subscriber_count = delivered,
                                        duration_ms = start.elapsed().as_millis() as u64,
                                        "Forwarded notification"
                                    );
                                }
                                Err(e) => warn!(
                                    event_kind = notification.channel(),
                                    error = %e,
                                    "Skipping malformed notification"
                                ),
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Notification listener receive failed, reconnecting");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        if let Err(e) = listener.unlisten_all().await {
            debug!(error = %e, "UNLISTEN failed during shutdown");
        }
    }
}
