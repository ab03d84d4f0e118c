//! AMQP plumbing: connection, durable queue declaration, deliveries.

use async_trait::async_trait;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use secrecy::ExposeSecret;

use crate::config::BrokerSettings;
use crate::error::ConnectionError;

/// AMQP reply code for a normal close.
pub const REPLY_SUCCESS: u16 = 200;

/// One message handed to the consumer by the broker.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn delivery_tag(&self) -> u64;

    fn payload(&self) -> &[u8];

    /// Tell the broker this delivery is done with; it will not be redelivered.
    async fn ack(&self) -> Result<(), ConnectionError>;
}

#[async_trait]
impl Delivery for lapin::message::Delivery {
    fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    fn payload(&self) -> &[u8] {
        &self.data
    }

    async fn ack(&self) -> Result<(), ConnectionError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::AckFailed {
                delivery_tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }
}

/// Connection URI for the configured broker. Credentials are embedded, so
/// never log the result.
pub fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = settings.host.clone();
    uri.authority.port = settings.port;
    uri.authority.userinfo = AMQPUserInfo {
        username: settings.username.clone(),
        password: settings.password.expose_secret().to_string(),
    };
    uri.vhost = settings.virtual_host.clone();
    uri
}

/// Open a connection and a channel on it.
pub async fn connect(settings: &BrokerSettings) -> Result<(Connection, Channel), ConnectionError> {
    let connect_err = |source| ConnectionError::Connect {
        host: settings.host.clone(),
        source,
    };

    let connection = Connection::connect_uri(amqp_uri(settings), ConnectionProperties::default())
        .await
        .map_err(connect_err)?;
    let channel = connection.create_channel().await.map_err(connect_err)?;

    tracing::debug!(
        host = %settings.host,
        virtual_host = %settings.virtual_host,
        "Broker connection open"
    );
    Ok((connection, channel))
}

/// Declare the queue durable and, when a named exchange is configured, bind
/// it with the routing key. Declaring is idempotent.
pub async fn declare(channel: &Channel, settings: &BrokerSettings) -> Result<(), ConnectionError> {
    let declare_err = |source| ConnectionError::Declare {
        queue: settings.queue.clone(),
        source,
    };

    channel
        .queue_declare(
            &settings.queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(declare_err)?;

    if let Some(exchange) = &settings.exchange {
        channel
            .queue_bind(
                &settings.queue,
                exchange,
                &settings.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_err)?;
        tracing::debug!(
            queue = %settings.queue,
            exchange = %exchange,
            routing_key = %settings.routing_key,
            "Queue bound"
        );
    }

    Ok(())
}

/// Register a consumer on the configured queue. Manual acks.
pub async fn consume(
    channel: &Channel,
    settings: &BrokerSettings,
) -> Result<Consumer, ConnectionError> {
    channel
        .basic_consume(
            &settings.queue,
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| ConnectionError::ConsumeFailed {
            queue: settings.queue.clone(),
            source,
        })
}

/// Close channel then connection, logging rather than failing.
pub async fn close(connection: &Connection, channel: &Channel) {
    if let Err(e) = channel.close(REPLY_SUCCESS, "closing").await {
        tracing::warn!(error = %e, "Failed to close broker channel");
    }
    if let Err(e) = connection.close(REPLY_SUCCESS, "closing").await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }
}
