// src/lapin_broker.rs
// Broker implementation backed by lapin

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    tcp::OwnedTLSConfig,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerResult, CloseEvent, Delivery,
    DialConfig, QueueInfo, RawConsumer,
};

/// Dials RabbitMQ through lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBroker;

#[async_trait]
impl Broker for LapinBroker {
    type Connection = LapinConnection;

    async fn dial(&self, config: &DialConfig) -> BrokerResult<LapinConnection> {
        let mut properties = ConnectionProperties::default();
        properties.client_properties = config.client_properties.clone();
        let properties = properties.with_connection_name(config.connection_name.clone().into());

        let connection = match &config.tls {
            Some(tls) => {
                let tls_config = OwnedTLSConfig {
                    cert_chain: tls.cert_chain.clone(),
                    ..OwnedTLSConfig::default()
                };
                Connection::connect_uri_with_config(config.uri.clone(), properties, tls_config)
                    .await?
            }
            None => Connection::connect_uri(config.uri.clone(), properties).await?,
        };

        // Connection-level failures never reach the channel error handlers
        let notifiers: Arc<Mutex<Vec<CloseNotifier>>> = Arc::default();
        let pending = Arc::clone(&notifiers);
        let connection_name = config.connection_name.clone();
        connection.on_error(move |error: LapinError| {
            warn!(connection_name = %connection_name, error = %error, "Connection lost");
            fail_channels(&pending, &error);
        });

        info!(
            connection_name = %config.connection_name,
            "Successfully connected to RabbitMQ"
        );
        Ok(LapinConnection {
            connection,
            notifiers,
        })
    }
}

type CloseNotifier = Arc<Mutex<Option<mpsc::UnboundedSender<CloseEvent>>>>;

pub struct LapinConnection {
    connection: Connection,
    // Close notifiers of the channels opened on this connection
    notifiers: Arc<Mutex<Vec<CloseNotifier>>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn open_channel(&self) -> BrokerResult<LapinChannel> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Opened channel");

        let close_notifier = CloseNotifier::default();
        if let Ok(mut notifiers) = self.notifiers.lock() {
            notifiers.push(Arc::clone(&close_notifier));
        }

        Ok(LapinChannel {
            channel,
            close_notifier,
        })
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> BrokerResult<()> {
        self.connection.close(reply_code, reply_text).await
    }
}

pub struct LapinChannel {
    channel: Channel,
    // Dropping the sender ends the notification stream
    close_notifier: CloseNotifier,
}

impl LapinChannel {
    fn release_notifier(&self) {
        if let Ok(mut notifier) = self.close_notifier.lock() {
            notifier.take();
        }
    }
}

/// Emit at most one event on `notifier`, then drop its sender.
fn send_once(notifier: &CloseNotifier, event: CloseEvent) {
    let sender = notifier.lock().ok().and_then(|mut guard| guard.take());
    if let Some(sender) = sender {
        let _ = sender.send(event);
    }
}

/// Report a connection failure to every channel still listening.
fn fail_channels(notifiers: &Mutex<Vec<CloseNotifier>>, error: &LapinError) {
    let notifiers = match notifiers.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => return,
    };

    for notifier in &notifiers {
        send_once(notifier, close_event(error));
    }
}

/// Classify a lapin channel or connection error: protocol errors carry the close frame the
/// broker sent, anything else was detected on our side.
pub fn close_event(error: &LapinError) -> CloseEvent {
    match error {
        LapinError::ProtocolError(amqp_error) => CloseEvent {
            server: true,
            code: u16::from(amqp_error.get_id()),
            reason: amqp_error.get_message().as_str().to_string(),
        },
        other => CloseEvent {
            server: false,
            code: 0,
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn qos(&self, prefetch_count: u16, options: BasicQosOptions) -> BrokerResult<()> {
        self.channel.basic_qos(prefetch_count, options).await
    }

    fn notify_close(&self) -> mpsc::UnboundedReceiver<CloseEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut notifier) = self.close_notifier.lock() {
            *notifier = Some(tx);
        }

        let notifier = Arc::clone(&self.close_notifier);
        self.channel.on_error(move |error: LapinError| {
            send_once(&notifier, close_event(&error));
        });

        rx
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> BrokerResult<QueueInfo> {
        let queue = self.channel.queue_declare(name, options, arguments).await?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> BrokerResult<RawConsumer> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, arguments)
            .await?;
        let tag = consumer.tag().as_str().to_string();

        Ok(RawConsumer {
            tag,
            deliveries: consumer
                .map(|delivery| delivery.map(into_delivery))
                .boxed(),
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        body: &[u8],
        properties: BasicProperties,
    ) -> BrokerResult<()> {
        self.channel
            .basic_publish(exchange, routing_key, options, body, properties)
            .await
            .map(|_confirm| ())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> BrokerResult<()> {
        self.release_notifier();
        self.channel.close(reply_code, reply_text).await
    }
}

/// Keeps the lapin delivery around so the message can settle it later.
struct LapinAcker {
    delivery: LapinDelivery,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, options: BasicAckOptions) -> BrokerResult<()> {
        self.delivery.ack(options).await.map(|_| ())
    }

    async fn nack(&self, options: BasicNackOptions) -> BrokerResult<()> {
        self.delivery.nack(options).await.map(|_| ())
    }
}

fn into_delivery(mut delivery: LapinDelivery) -> Delivery {
    let body = std::mem::take(&mut delivery.data);

    Delivery {
        delivery_tag: delivery.delivery_tag,
        properties: delivery.properties.clone(),
        body,
        acker: Box::new(LapinAcker { delivery }),
    }
}
