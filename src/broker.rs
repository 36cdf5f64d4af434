// src/broker.rs
// The operations the client needs from a broker connection and channel

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Error as LapinError,
};
use std::fmt;
use tokio::sync::mpsc;

pub type BrokerResult<T> = std::result::Result<T, LapinError>;

/// Stream of deliveries for one consumer; ends when the consumer is
/// cancelled or its channel closes.
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// TLS settings handed to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM encoded CA chain used to verify the broker certificate
    pub cert_chain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DialConfig {
    pub uri: AMQPUri,
    pub connection_name: String,
    pub client_properties: FieldTable,
    pub tls: Option<TlsConfig>,
}

/// A channel closure reported by the broker library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// True when the broker initiated the closure
    pub server: bool,
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

pub struct RawConsumer {
    /// Consumer tag as registered with the broker
    pub tag: String,
    pub deliveries: DeliveryStream,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, options: BasicAckOptions) -> BrokerResult<()>;

    async fn nack(&self, options: BasicNackOptions) -> BrokerResult<()>;
}

/// One message as delivered by the broker, before it is wrapped for the
/// application.
pub struct Delivery {
    pub delivery_tag: u64,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn dial(&self, config: &DialConfig) -> BrokerResult<Self::Connection>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> BrokerResult<Self::Channel>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> BrokerResult<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn qos(&self, prefetch_count: u16, options: BasicQosOptions) -> BrokerResult<()>;

    /// Source of closure notifications for this channel. The receiver yields
    /// at most one event and ends once the channel is closed or its
    /// connection fails.
    fn notify_close(&self) -> mpsc::UnboundedReceiver<CloseEvent>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> BrokerResult<QueueInfo>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> BrokerResult<RawConsumer>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        body: &[u8],
        properties: BasicProperties,
    ) -> BrokerResult<()>;

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> BrokerResult<()>;
}
