//! Queue-driven dispatch loop.

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::binder::bind;
use crate::broker::{self, Delivery};
use crate::config::{BrokerSettings, SmtpSettings};
use crate::error::{ConnectionError, DeliveryError, DispatchError};
use crate::mailer::{Mailer, SendEmail, send_email};
use crate::request::decode_payload;
use crate::worker::state::WorkerState;

/// Parameter name the configured SMTP host is injected under.
const HOST_PARAM: &str = "host";

/// Counts of deliveries handled during one consume run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Deliveries that were sent successfully.
    pub sent: u64,
    /// Deliveries that were acknowledged, then dropped after a failure.
    pub dropped: u64,
}

/// Consumes email requests and sends them, one delivery at a time.
pub struct Worker {
    smtp: SmtpSettings,
    mailer: Arc<dyn Mailer>,
    state: WorkerState,
}

impl Worker {
    pub fn new(smtp: SmtpSettings, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            smtp,
            mailer,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, to: WorkerState) {
        if !self.state.can_transition_to(to) {
            tracing::warn!(from = %self.state, to = %to, "Unexpected worker state transition");
        }
        tracing::debug!(from = %self.state, to = %to, "Worker state");
        self.state = to;
    }

    fn check<T>(&mut self, result: Result<T, ConnectionError>) -> Result<T, ConnectionError> {
        if result.is_err() {
            self.transition(WorkerState::Faulted);
        }
        result
    }

    /// Connect, declare the durable queue, and consume until `shutdown`
    /// resolves. Broker failures are fatal and returned.
    pub async fn start<F>(
        &mut self,
        settings: &BrokerSettings,
        shutdown: F,
    ) -> Result<RunSummary, ConnectionError>
    where
        F: Future<Output = ()>,
    {
        let connected = broker::connect(settings).await;
        let (connection, channel) = self.check(connected)?;
        self.transition(WorkerState::Connected);

        let declared = broker::declare(&channel, settings).await;
        self.check(declared)?;
        let consumer = broker::consume(&channel, settings).await;
        let consumer = self.check(consumer)?;

        tracing::info!(
            rabbitmq_host = %settings.host,
            virtual_host = %settings.virtual_host,
            username = %settings.username,
            queue = %settings.queue,
            smtp_host = %self.smtp.host,
            dry_run = self.smtp.dry_run,
            "Worker started"
        );

        let queue = settings.queue.clone();
        let deliveries = consumer.map(move |delivery| {
            delivery.map_err(|source| ConnectionError::ConsumeFailed {
                queue: queue.clone(),
                source,
            })
        });

        let summary = self.run(deliveries, shutdown).await;
        broker::close(&connection, &channel).await;
        summary
    }

    /// Consume `deliveries` in order until the stream ends or `shutdown`
    /// resolves. A delivery already being handled always completes first.
    ///
    /// Per-delivery failures are logged and counted; only broker errors end
    /// the loop early.
    pub async fn run<S, D, F>(
        &mut self,
        deliveries: S,
        shutdown: F,
    ) -> Result<RunSummary, ConnectionError>
    where
        S: Stream<Item = Result<D, ConnectionError>>,
        D: Delivery,
        F: Future<Output = ()>,
    {
        tokio::pin!(deliveries);
        tokio::pin!(shutdown);

        self.transition(WorkerState::Consuming);
        let mut summary = RunSummary::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, closing");
                    break;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    self.transition(WorkerState::Faulted);
                    return Err(e);
                }
                None => {
                    tracing::info!("Delivery stream ended");
                    break;
                }
            };

            let handled = self.handle(&delivery).await;
            match self.check(handled)? {
                Ok(()) => summary.sent += 1,
                Err(_) => summary.dropped += 1,
            }
        }

        self.transition(WorkerState::Closing);
        tracing::info!(sent = summary.sent, dropped = summary.dropped, "Worker stopped");
        Ok(summary)
    }

    /// Handle one delivery: acknowledge it, then try to send it.
    ///
    /// The ack always comes first, so a delivery that fails afterwards is
    /// gone for good. The outer `Result` is a broker failure (fatal); the
    /// inner one is the per-message outcome, already logged here.
    pub async fn handle<D: Delivery>(
        &self,
        delivery: &D,
    ) -> Result<Result<(), DispatchError>, ConnectionError> {
        let delivery_tag = delivery.delivery_tag();
        delivery.ack().await?;
        tracing::debug!(delivery_tag, "Delivery acknowledged");

        let outcome = self.dispatch(delivery.payload()).await;
        match &outcome {
            Ok(()) => tracing::debug!(delivery_tag, "Email dispatched"),
            Err(e) => tracing::error!(
                delivery_tag,
                error = %e,
                payload = %String::from_utf8_lossy(delivery.payload()),
                smtp_host = %self.smtp.host,
                "Dropping delivery"
            ),
        }
        Ok(outcome)
    }

    async fn dispatch(&self, payload: &[u8]) -> Result<(), DispatchError> {
        let mut args = decode_payload(payload)?;
        args.insert(HOST_PARAM.to_string(), Value::String(self.smtp.host.clone()));
        tracing::debug!(args = ?args, "Deserialized delivery");

        let params: SendEmail = bind(args)?;
        let mailer = Arc::clone(&self.mailer);
        let host = params.host.clone();

        // SMTP I/O is blocking; awaiting it keeps deliveries strictly sequential.
        tokio::task::spawn_blocking(move || send_email(mailer.as_ref(), params))
            .await
            .map_err(|e| DeliveryError::Transport {
                host,
                reason: format!("mailer task failed: {e}"),
            })??;

        Ok(())
    }
}
