//! Rate-limited hand-off between message ingestion and outbound dispatch.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::types::InboundMessage;
use crate::domain::ChatId;
use crate::ports::Broker;
use crate::registry::SessionRegistry;
use crate::relay::RelayPipeline;
use crate::Result;

/// Payload stored in the broker per (message, destination) forward.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardJob {
    pub chat_id_to: ChatId,
    pub message: InboundMessage,
    /// Attribution title resolved at ingestion time.
    pub title: String,
    /// Date of the original post.
    pub date: i64,
}

const READY_POLL: Duration = Duration::from_secs(1);

/// Durable ordered queue between the relay pipeline and the single dispatch
/// consumer.
///
/// The consumer enforces `sending_delay` between consecutive sends across
/// all destinations; running more than one consumer would break that
/// throttle, so [`run`] is spawned exactly once.
///
/// [`run`]: DeliveryQueue::run
pub struct DeliveryQueue {
    broker: Arc<dyn Broker>,
    registry: Arc<SessionRegistry>,
    sending_delay: Duration,
}

impl DeliveryQueue {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<SessionRegistry>,
        sending_delay: Duration,
    ) -> Self {
        Self {
            broker,
            registry,
            sending_delay,
        }
    }

    /// Durably store the job; returns only once the broker has it.
    pub async fn enqueue(&self, job: &ForwardJob) -> Result<()> {
        self.broker.enqueue(job).await?;
        debug!(msg_id = job.message.id.0, chat_id_to = job.chat_id_to.0, "put message to queue");
        Ok(())
    }

    /// Consumer loop. A delivery is acknowledged only after the dispatch
    /// reports the ledger write confirmed; a dispatch error returns the
    /// delivery to the broker for redelivery.
    pub async fn run(&self, relay: Arc<RelayPipeline>, cancel: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.broker.recv() => match received {
                    Ok(d) => d,
                    Err(e) => {
                        error!(error = %e, "broker receive failed");
                        sleep(READY_POLL).await;
                        continue;
                    }
                },
            };

            // Do not start processing until the forwarding account is live;
            // the message waits rather than failing.
            while !self.registry.is_ready().await {
                if cancel.is_cancelled() {
                    // Left unacked on purpose: redelivered on next start.
                    return;
                }
                sleep(READY_POLL).await;
            }

            sleep(self.sending_delay).await;

            debug!(msg_id = delivery.job.message.id.0, "processing message");
            match relay.dispatch(&delivery.job).await {
                Ok(()) => {
                    if let Err(e) = self.broker.ack(delivery.tag).await {
                        error!(error = %e, tag = delivery.tag, "ack failed");
                    }
                }
                Err(e) => {
                    error!(error = %e, msg_id = delivery.job.message.id.0, "dispatch failed, returning to queue");
                    if let Err(e) = self.broker.nack(delivery.tag).await {
                        error!(error = %e, tag = delivery.tag, "nack failed");
                    }
                }
            }
        }
    }
}
