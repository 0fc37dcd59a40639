//! Outbound frame delivery with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, Result};
use crate::logging::Dumps;
use crate::transport::{NotificationHandler, Transport};

/// Outcome of a [`RequestDispatcher::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The frame was written.
    Sent,
    /// The transport was down, nothing was written.
    Skipped,
    /// Every write attempt failed. The first failure has already been
    /// reported to the error channel.
    Failed(ConnectionError),
    /// The attempt was torn down while the send was in progress.
    Cancelled,
}

/// Writes frames for one connection attempt.
///
/// Cloning shares the transport, the error channel and the task tracker, so
/// fire-and-forget replies spawned from any clone are cancelled together.
#[derive(Clone)]
pub(crate) struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    retries: u32,
    delay_step: Duration,
    dumps: Dumps,
    errors: mpsc::UnboundedSender<ConnectionError>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl RequestDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &ConnectionConfig,
        errors: mpsc::UnboundedSender<ConnectionError>,
        tasks: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            retries: config.send.retries,
            delay_step: config.send_retry_delay_step(),
            dumps: Dumps::from(&config.logging),
            errors,
            tasks,
            cancel,
        }
    }

    /// Write `frame`, first routing the next notifications to `handler` when
    /// one is given.
    ///
    /// A failed write is retried `retries` times, waiting `step * n` before
    /// retry `n`.
    pub async fn send(&self, frame: &[u8], handler: Option<NotificationHandler>) -> Delivery {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Delivery::Cancelled,
            delivery = self.deliver(frame, handler) => delivery,
        }
    }

    /// Send `frame` in the background without waiting for the write.
    pub fn reply(&self, frame: Vec<u8>) {
        let dispatcher = self.clone();
        self.tasks.spawn(async move {
            if let Delivery::Failed(err) = dispatcher.send(&frame, None).await {
                debug!(error = %err, "reply was not delivered");
            }
        });
    }

    /// Send `frame` on a tracked task and resolve `done` once the send
    /// settles. Write failures go to the error channel, not to `done`.
    pub fn send_detached(&self, frame: Vec<u8>, done: oneshot::Sender<Result<()>>) {
        let dispatcher = self.clone();
        self.tasks.spawn(async move {
            if let Delivery::Failed(err) = dispatcher.send(&frame, None).await {
                debug!(error = %err, "packet was not delivered");
            }
            let _ = done.send(Ok(()));
        });
    }

    /// Cancel in-flight sends and wait for every reply task to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn deliver(&self, frame: &[u8], handler: Option<NotificationHandler>) -> Delivery {
        if !self.transport.is_connected() {
            debug!("transport is not connected, dropping request");
            return Delivery::Skipped;
        }

        if let Some(handler) = handler {
            if let Err(err) = self.transport.subscribe(handler).await {
                let err = ConnectionError::SendRequest(format!("subscribe failed: {}", err));
                self.report(err.clone());
                return Delivery::Failed(err);
            }
        }

        let mut first_error = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.delay_step * attempt).await;
            }
            if !self.transport.is_connected() {
                debug!(attempt, "transport went down, abandoning request");
                return Delivery::Skipped;
            }

            self.dumps.encrypted("tx", frame);
            match self.transport.write(frame).await {
                Ok(()) => return Delivery::Sent,
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "write failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        let cause = first_error.map(|err| err.to_string()).unwrap_or_default();
        let err = ConnectionError::SendRequest(format!(
            "write failed after {} attempts: {}",
            self.retries + 1,
            cause
        ));
        self.report(err.clone());
        Delivery::Failed(err)
    }

    fn report(&self, err: ConnectionError) {
        // The driver may already be gone during teardown.
        let _ = self.errors.send(err);
    }
}
