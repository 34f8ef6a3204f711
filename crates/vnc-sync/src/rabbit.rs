//! AMQP consumer for the object-update exchange.

use std::sync::Arc;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Connection, ConnectionProperties, Consumer};
use tracing::{error, info, warn};

use vnc_graph::GraphBackend;
use vnc_store::Store;

use crate::sync::Syncer;
use crate::Notification;

/// Fan-out exchange carrying config object updates.
pub const VNC_EXCHANGE: &str = "vnc_config.object-update";

/// Default name of the sync queue.
pub const DEFAULT_QUEUE: &str = "gremlin.sync";

const QUEUE_EXPIRES_MS: i32 = 180_000;

#[derive(Debug, Clone)]
pub struct RabbitConfig {
    pub server: String,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub queue: String,
}

impl RabbitConfig {
    fn uri(&self) -> String {
        let vhost = if self.vhost == "/" { "%2f".to_string() } else { self.vhost.clone() };
        format!("amqp://{}:{}@{}/{}", self.user, self.password, self.server, vhost)
    }
}

/// Declare and bind the sync queue, then open a manually-acked consumer.
///
/// The queue is non-durable, exclusive and auto-deleted, with a 180 s
/// expiry so an abandoned queue does not pile up messages.
pub async fn consume(config: &RabbitConfig) -> anyhow::Result<(Connection, Consumer)> {
    info!(server = %config.server, vhost = %config.vhost, "Connecting to RabbitMQ");
    let connection = Connection::connect(&config.uri(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    let mut arguments = FieldTable::default();
    arguments.insert("x-expires".into(), AMQPValue::LongInt(QUEUE_EXPIRES_MS));
    let queue = channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
            arguments,
        )
        .await?;

    channel
        .queue_bind(
            queue.name().as_str(),
            VNC_EXCHANGE,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let consumer = channel
        .basic_consume(
            queue.name().as_str(),
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!("Connected to RabbitMQ");
    Ok((connection, consumer))
}

/// Feed deliveries into the syncer until the consumer stream closes.
pub async fn run<S, B>(syncer: Arc<Syncer<S, B>>, mut consumer: Consumer)
where
    S: Store + 'static,
    B: GraphBackend + 'static,
{
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(error = %e, "Consumer error");
                continue;
            }
        };
        let notification: Notification = match serde_json::from_slice(&delivery.data) {
            Ok(notification) => notification,
            Err(e) => {
                error!(error = %e, "Unparseable notification");
                if let Err(e) = delivery.nack(BasicNackOptions::default()).await {
                    warn!(error = %e, "Failed to nack");
                }
                continue;
            }
        };
        if syncer.handle_notification(notification).await {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                warn!(error = %e, "Failed to ack");
            }
        } else if let Err(e) = delivery.nack(BasicNackOptions::default()).await {
            warn!(error = %e, "Failed to nack");
        }
    }
    info!("Notification stream closed");
}
