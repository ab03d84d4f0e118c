//! Publishes email requests to the worker's queue.
//!
//! Used by the `publish` command for smoke tests. Every message goes out in
//! the same JSON shape the worker decodes.

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel, Connection};

use crate::broker;
use crate::config::BrokerSettings;
use crate::error::ConnectionError;
use crate::request::EmailRequest;

pub struct Publisher {
    connection: Connection,
    channel: Channel,
    exchange: String,
    routing_key: String,
}

impl Publisher {
    /// Connect, enable publisher confirms, and make sure the durable queue
    /// exists so the message is held until a worker starts.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, ConnectionError> {
        let (connection, channel) = broker::connect(settings).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|source| ConnectionError::Connect {
                host: settings.host.clone(),
                source,
            })?;
        broker::declare(&channel, settings).await?;

        Ok(Self {
            connection,
            channel,
            exchange: settings.exchange.clone().unwrap_or_default(),
            routing_key: settings.routing_key.clone(),
        })
    }

    /// Publish one request and wait for the broker to confirm it.
    pub async fn publish(&self, request: &EmailRequest) -> Result<(), ConnectionError> {
        let publish_err = |source| ConnectionError::PublishFailed {
            routing_key: self.routing_key.clone(),
            source,
        };

        let payload = encode(request)?;
        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;

        if confirmation.is_nack() {
            return Err(ConnectionError::Nacked {
                routing_key: self.routing_key.clone(),
            });
        }

        tracing::info!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            to = %request.toaddrs,
            "Published email request"
        );
        Ok(())
    }

    /// Publish `count` copies of `request`.
    pub async fn publish_many(
        &self,
        request: &EmailRequest,
        count: u32,
    ) -> Result<(), ConnectionError> {
        for _ in 0..count {
            self.publish(request).await?;
        }
        Ok(())
    }

    pub async fn close(self) {
        broker::close(&self.connection, &self.channel).await;
    }
}

/// Connect, publish `count` copies of `request`, and disconnect.
pub async fn publish(
    settings: &BrokerSettings,
    request: &EmailRequest,
    count: u32,
) -> Result<(), ConnectionError> {
    let publisher = Publisher::connect(settings).await?;
    let result = publisher.publish_many(request, count).await;
    publisher.close().await;
    result
}

fn encode(request: &EmailRequest) -> Result<Vec<u8>, ConnectionError> {
    request
        .to_payload()
        .map_err(|source| ConnectionError::Encode { source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::bind;
    use crate::request::decode_payload;

    #[test]
    fn encoded_payload_is_what_the_worker_decodes() {
        let request = EmailRequest::new("a@x.com", "b@x.com", "hi").with_subject("hello");
        let payload = encode(&request).unwrap();
        let decoded: EmailRequest = bind(decode_payload(&payload).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }
}
