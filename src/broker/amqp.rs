//! AMQP 0-9-1 transport backed by lapin
//!
//! Each pooled connection owns one lapin `Connection` and one `Channel` in
//! publisher-confirm mode, so a publish only counts as delivered once the
//! broker has acked it.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::{BrokerChannel, BrokerError, Connector};
use crate::config::BrokerConfig;

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        // Soft errors that name the request itself as the problem.
        if let lapin::Error::ProtocolError(amqp) = &err {
            if let AMQPErrorKind::Soft(soft) = amqp.kind() {
                if matches!(
                    soft,
                    AMQPSoftError::ACCESSREFUSED
                        | AMQPSoftError::NOTFOUND
                        | AMQPSoftError::PRECONDITIONFAILED
                ) {
                    return BrokerError::Rejected(amqp.to_string());
                }
            }
        }
        BrokerError::Transport(err.to_string())
    }
}

/// Opens lapin connections to a single broker
pub struct AmqpConnector {
    uri: String,
    target: String,
    durable: bool,
}

impl AmqpConnector {
    /// Create a connector from broker settings
    ///
    /// `durable` controls both queue durability and message persistence.
    pub fn new(broker: &BrokerConfig, durable: bool) -> Self {
        Self {
            uri: broker.amqp_uri(),
            target: broker.endpoint(),
            durable,
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        debug!(broker = %self.target, "Opening AMQP connection");

        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!(
            broker = %self.target,
            channel_id = channel.id(),
            "Opened AMQP channel"
        );

        Ok(Box::new(AmqpChannel {
            connection,
            channel,
            declared: HashSet::new(),
            durable: self.durable,
        }))
    }

    fn describe(&self) -> String {
        format!("amqp://{}", self.target)
    }
}

/// One lapin connection plus its publishing channel
struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    /// Queues already declared on this channel
    declared: HashSet<String>,
    durable: bool,
}

impl AmqpChannel {
    async fn declare(&mut self, destination: &str) -> Result<(), BrokerError> {
        if self.declared.contains(destination) {
            return Ok(());
        }

        let options = QueueDeclareOptions {
            durable: self.durable,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(destination, options, FieldTable::default())
            .await?;

        debug!(queue = %destination, durable = self.durable, "Declared queue");
        self.declared.insert(destination.to_string());
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn publish(&mut self, destination: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.declare(destination).await?;

        let delivery_mode = if self.durable {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };
        let properties = BasicProperties::default().with_delivery_mode(delivery_mode);

        // Default exchange: the routing key is the queue name.
        let confirmation = self
            .channel
            .basic_publish(
                "",
                destination,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => {
                warn!(queue = %destination, "Broker nacked publish");
                Err(BrokerError::Nacked)
            }
            _ => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&mut self) {
        if let Err(e) = self.connection.close(200, "OK").await {
            debug!(error = %e, "AMQP close failed");
        }
    }
}
