// src/client.rs
// Connection/channel lifecycle plus publish and subscribe

use chrono::Utc;
use futures_lite::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge;
use crate::broker::{Broker, BrokerChannel, BrokerConnection, DeliveryStream, QueueInfo};
use crate::errors::{ClientError, CloseError, Result};
use crate::lapin_broker::LapinBroker;
use crate::message::{Message, MessageHeader};
use crate::params::{to_field_table, ConnectionParams};

const REPLY_SUCCESS: u16 = 200;

// Single slot: the forwarding task waits for the reader, prefetch does the rest
const RECEIVE_BUFFER: usize = 1;

struct Session<C: BrokerConnection> {
    connection: C,
    channel: Option<C::Channel>,
    queue: Option<QueueInfo>,
    consumer_tag: Option<String>,
}

impl<C: BrokerConnection> Session<C> {
    fn new(connection: C, channel: Option<C::Channel>) -> Self {
        Self {
            connection,
            channel,
            queue: None,
            consumer_tag: None,
        }
    }
}

/// Publish/subscribe client bound to a single broker connection and channel.
///
/// A client is used once: `connect`, then publish and/or `subscribe`, then
/// `close`. Recovering from a lost connection means closing this client and
/// connecting a fresh one.
pub struct Client<B: Broker = LapinBroker> {
    params: ConnectionParams,
    broker: B,
    session: Option<Session<B::Connection>>,
    outgoing: Option<mpsc::Sender<Message>>,
    incoming: Option<mpsc::Receiver<Message>>,
    errors_tx: mpsc::UnboundedSender<CloseError>,
    errors_rx: Option<mpsc::UnboundedReceiver<CloseError>>,
}

impl Client<LapinBroker> {
    pub fn new(uri: &str) -> Result<Self> {
        Ok(Self::with_broker(ConnectionParams::from_uri(uri)?, LapinBroker))
    }
}

impl<B: Broker> Client<B> {
    pub fn with_broker(params: ConnectionParams, broker: B) -> Self {
        let (outgoing, incoming) = mpsc::channel(RECEIVE_BUFFER);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        Self {
            params,
            broker,
            session: None,
            outgoing: Some(outgoing),
            incoming: Some(incoming),
            errors_tx,
            errors_rx: Some(errors_rx),
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Parameters may be changed freely before `connect`. Changing `auto_ack`
    /// after `subscribe` has no effect on the running subscription.
    pub fn params_mut(&mut self) -> &mut ConnectionParams {
        &mut self.params
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// The queue declared by `connect`, if any
    pub fn queue(&self) -> Option<&QueueInfo> {
        self.session.as_ref().and_then(|s| s.queue.as_ref())
    }

    /// Dial the broker, open a channel, apply QoS and declare the queue.
    ///
    /// Fails with [`ClientError::AlreadyConnected`] while a session is open.
    /// A failed channel open closes the connection again. A failed queue
    /// declaration closes the channel but keeps the connection, so `close`
    /// must still be called.
    #[instrument(skip(self), fields(client_id = %self.params.id))]
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            warn!("connect called on a connected client");
            return Err(ClientError::AlreadyConnected);
        }

        self.params.ensure_client_properties();
        let dial = self.params.dial_config();

        info!(
            host = %self.params.host,
            port = self.params.port,
            vhost = %self.params.vhost,
            tls = self.params.is_tls(),
            "Attempting to connect to RabbitMQ"
        );

        let dialed = if self.params.connect_timeout.is_zero() {
            self.broker.dial(&dial).await
        } else {
            tokio::time::timeout(self.params.connect_timeout, self.broker.dial(&dial))
                .await
                .map_err(|_| ClientError::Timeout(self.params.connect_timeout))?
        };
        let connection = dialed.map_err(|e| {
            error!(error = %e, "Failed to connect to RabbitMQ");
            ClientError::Connection(e)
        })?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to open channel");
                if let Err(close_err) = connection
                    .close(REPLY_SUCCESS, "channel open failed")
                    .await
                {
                    warn!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(ClientError::Channel(e));
            }
        };

        if let Err(e) = channel
            .qos(self.params.prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = %e, prefetch = self.params.prefetch, "Failed to apply QoS");
            self.session = Some(Session::new(connection, None));
            return Err(ClientError::Qos(e));
        }

        // Started before the queue declaration so no closure during setup is missed
        bridge::spawn(
            channel.notify_close(),
            self.errors_tx.clone(),
            self.params.id.clone(),
        );

        if self.params.queue_name.is_empty() {
            info!("Connected without a queue (publish only)");
            self.session = Some(Session::new(connection, Some(channel)));
            return Ok(());
        }

        let options = QueueDeclareOptions {
            passive: false,
            durable: self.params.durable,
            exclusive: self.params.exclusive,
            auto_delete: self.params.autodelete,
            nowait: false,
        };

        match channel
            .queue_declare(
                &self.params.queue_name,
                options,
                to_field_table(&self.params.headers),
            )
            .await
        {
            Ok(queue) => {
                info!(
                    queue = %queue.name,
                    messages = queue.message_count,
                    consumers = queue.consumer_count,
                    "Queue declared"
                );
                let mut session = Session::new(connection, Some(channel));
                session.queue = Some(queue);
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                error!(queue = %self.params.queue_name, error = %e, "Failed to declare queue");
                if let Err(close_err) = channel.close(REPLY_SUCCESS, "queue declare failed").await {
                    warn!(error = %close_err, "Failed to close channel after declare error");
                }
                self.session = Some(Session::new(connection, None));
                Err(ClientError::QueueDeclare(e))
            }
        }
    }

    /// Cancel the consumer, close the channel and close the connection.
    ///
    /// Every step is attempted; all failures come back together as
    /// [`ClientError::Teardown`].
    #[instrument(skip(self), fields(client_id = %self.params.id))]
    pub async fn close(&mut self) -> Result<()> {
        let session = self.session.take().ok_or(ClientError::NotConnected)?;
        let mut errors = Vec::new();

        if let Some(channel) = &session.channel {
            if let Some(tag) = &session.consumer_tag {
                if let Err(e) = channel.cancel(tag).await {
                    warn!(consumer_tag = %tag, error = %e, "Failed to cancel consumer");
                    errors.push(ClientError::Cancel(e));
                }
            }

            if let Err(e) = channel.close(REPLY_SUCCESS, "Closing channel").await {
                warn!(error = %e, "Failed to close channel");
                errors.push(ClientError::ChannelClose(e));
            }
        }

        if let Err(e) = session
            .connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await
        {
            warn!(error = %e, "Failed to close connection");
            errors.push(ClientError::ConnectionClose(e));
        }

        if errors.is_empty() {
            info!("Closed RabbitMQ connection gracefully");
            Ok(())
        } else {
            Err(ClientError::Teardown(errors))
        }
    }

    fn channel(&self) -> Result<&<B::Connection as BrokerConnection>::Channel> {
        self.session
            .as_ref()
            .and_then(|s| s.channel.as_ref())
            .ok_or(ClientError::NotConnected)
    }

    /// Publish a single message.
    pub async fn publish(&self, data: &[u8], header: &MessageHeader) -> Result<()> {
        let channel = self.channel()?;
        let properties = header.to_properties(Utc::now().timestamp() as u64);
        let options = BasicPublishOptions {
            mandatory: self.params.mandatory,
            immediate: self.params.immediate,
        };

        channel
            .publish(
                &self.params.exchange_name,
                &self.params.routing_key,
                options,
                data,
                properties,
            )
            .await
            .map_err(ClientError::Publish)?;

        debug!(
            exchange = %self.params.exchange_name,
            routing_key = %self.params.routing_key,
            bytes = data.len(),
            "Published message"
        );
        Ok(())
    }

    /// Publish the bytes of every line read from `reader` as its own message,
    /// stopping at the first failure. Lines end at `\n`; a trailing `\r` is
    /// dropped. Returns the number of messages published.
    pub async fn publish_lines<R>(&self, reader: R, header: &MessageHeader) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.split(b'\n');
        let mut published = 0;

        while let Some(mut line) = lines.next_segment().await? {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.publish(&line, header).await?;
            published += 1;
        }

        debug!(published, "Finished publishing lines");
        Ok(published)
    }

    /// Start consuming from the declared queue and hand back the broker's
    /// delivery stream untouched.
    pub async fn subscribe_raw(&mut self) -> Result<DeliveryStream> {
        let session = self.session.as_mut().ok_or(ClientError::NotConnected)?;
        let channel = session.channel.as_ref().ok_or(ClientError::NotConnected)?;
        let queue = session.queue.as_ref().ok_or(ClientError::NoQueue)?;

        let options = BasicConsumeOptions {
            no_local: false,
            no_ack: self.params.auto_ack,
            exclusive: self.params.exclusive,
            nowait: false,
        };

        let consumer = channel
            .consume(
                &queue.name,
                &self.params.id,
                options,
                to_field_table(&self.params.headers),
            )
            .await
            .map_err(ClientError::Consume)?;

        info!(
            queue = %queue.name,
            consumer_tag = %consumer.tag,
            auto_ack = self.params.auto_ack,
            "Started consuming"
        );
        session.consumer_tag = Some(consumer.tag);
        Ok(consumer.deliveries)
    }

    /// Start consuming and forward each delivery as a [`Message`] to the
    /// receiver returned by [`Client::receive`]. The receiver closes when the
    /// broker ends the consumer.
    pub async fn subscribe(&mut self) -> Result<()> {
        let outgoing = self.outgoing.take().ok_or(ClientError::AlreadySubscribed)?;

        let deliveries = match self.subscribe_raw().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.outgoing = Some(outgoing);
                return Err(e);
            }
        };

        // Fixed for the lifetime of this consumer, matching its no_ack flag
        let ack_required = !self.params.auto_ack;
        tokio::spawn(forward_deliveries(
            deliveries,
            outgoing,
            ack_required,
            self.params.id.clone(),
        ));

        Ok(())
    }

    /// Receiver of subscribed messages. Available once; later calls return
    /// `None`.
    pub fn receive(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.incoming.take()
    }

    /// Receiver of asynchronous channel closures. Available once; later calls
    /// return `None`.
    pub fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<CloseError>> {
        self.errors_rx.take()
    }
}

async fn forward_deliveries(
    mut deliveries: DeliveryStream,
    outgoing: mpsc::Sender<Message>,
    ack_required: bool,
    client_id: String,
) {
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => {
                let message = Message::from_delivery(delivery, ack_required);
                if outgoing.send(message).await.is_err() {
                    debug!(client_id = %client_id, "Message receiver dropped, stop forwarding");
                    return;
                }
            }
            Err(e) => error!(client_id = %client_id, error = %e, "Error receiving message"),
        }
    }

    info!(client_id = %client_id, "Delivery stream ended, closing message channel");
}
