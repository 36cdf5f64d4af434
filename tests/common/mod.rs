// Recording in-memory broker used by the client tests
#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc as stream_mpsc;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ChannelState, Error as LapinError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use qcat::broker::BrokerResult;
use qcat::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, CloseEvent, Delivery, DialConfig,
    QueueInfo, RawConsumer,
};

#[derive(Debug, Clone)]
pub enum Call {
    Dial,
    OpenChannel,
    Qos {
        prefetch: u16,
        global: bool,
    },
    QueueDeclare {
        name: String,
        durable: bool,
        auto_delete: bool,
        exclusive: bool,
        nowait: bool,
    },
    Consume {
        queue: String,
        tag: String,
        no_ack: bool,
        exclusive: bool,
    },
    Publish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
        body: Vec<u8>,
        properties: BasicProperties,
    },
    Cancel(String),
    ChannelClose,
    ConnectionClose,
    Ack {
        tag: u64,
        multiple: bool,
    },
    Nack {
        tag: u64,
        multiple: bool,
        requeue: bool,
    },
}

/// Which broker operations should fail.
#[derive(Debug, Default, Clone)]
pub struct Failures {
    pub dial: bool,
    pub dial_delay: Option<Duration>,
    pub open_channel: bool,
    pub qos: bool,
    pub queue_declare: bool,
    pub consume: bool,
    pub publish: bool,
    pub cancel: bool,
    pub channel_close: bool,
    pub connection_close: bool,
}

#[derive(Default)]
struct State {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Failures>,
    dial_config: Mutex<Option<DialConfig>>,
    close_notifier: Mutex<Option<mpsc::UnboundedSender<CloseEvent>>>,
    delivery_tx: Mutex<Option<stream_mpsc::UnboundedSender<BrokerResult<Delivery>>>>,
    delivery_rx: Mutex<Option<stream_mpsc::UnboundedReceiver<BrokerResult<Delivery>>>>,
    next_tag: Mutex<u64>,
}

impl State {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn fails(&self, pick: impl Fn(&Failures) -> bool) -> bool {
        let failures = self.failures.lock().unwrap();
        pick(&failures)
    }
}

pub fn broker_error() -> LapinError {
    LapinError::InvalidChannelState(ChannelState::Closed)
}

#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<State>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let (tx, rx) = stream_mpsc::unbounded();
        let state = State::default();
        *state.delivery_tx.lock().unwrap() = Some(tx);
        *state.delivery_rx.lock().unwrap() = Some(rx);

        Self {
            state: Arc::new(state),
        }
    }

    pub fn failing(failures: Failures) -> Self {
        let broker = Self::new();
        *broker.state.failures.lock().unwrap() = failures;
        broker
    }

    pub fn set_failures(&self, failures: Failures) {
        *self.state.failures.lock().unwrap() = failures;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn dial_config(&self) -> Option<DialConfig> {
        self.state.dial_config.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<(Vec<u8>, BasicProperties)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish {
                    body, properties, ..
                } => Some((body, properties)),
                _ => None,
            })
            .collect()
    }

    /// Push a delivery to the active consumer.
    pub fn deliver(&self, body: &[u8], properties: BasicProperties) {
        let tag = {
            let mut next = self.state.next_tag.lock().unwrap();
            *next += 1;
            *next
        };
        let delivery = Delivery {
            delivery_tag: tag,
            properties,
            body: body.to_vec(),
            acker: Box::new(FakeAcker {
                tag,
                state: Arc::clone(&self.state),
            }),
        };

        if let Some(tx) = self.state.delivery_tx.lock().unwrap().as_ref() {
            tx.unbounded_send(Ok(delivery)).unwrap();
        }
    }

    /// Fail the delivery stream once without ending it.
    pub fn deliver_error(&self) {
        if let Some(tx) = self.state.delivery_tx.lock().unwrap().as_ref() {
            tx.unbounded_send(Err(broker_error())).unwrap();
        }
    }

    /// End the consumer, as the broker does on cancel or channel closure.
    pub fn end_deliveries(&self) {
        self.state.delivery_tx.lock().unwrap().take();
    }

    /// Report a channel closure through the close notification source.
    pub fn emit_close(&self, event: CloseEvent) {
        let notifier = self.state.close_notifier.lock().unwrap().take();
        if let Some(tx) = notifier {
            tx.send(event).unwrap();
        }
    }
}

pub struct FakeConnection {
    state: Arc<State>,
}

pub struct FakeChannel {
    state: Arc<State>,
}

struct FakeAcker {
    tag: u64,
    state: Arc<State>,
}

#[async_trait]
impl Broker for FakeBroker {
    type Connection = FakeConnection;

    async fn dial(&self, config: &DialConfig) -> BrokerResult<FakeConnection> {
        self.state.record(Call::Dial);
        *self.state.dial_config.lock().unwrap() = Some(config.clone());

        let delay = self.state.failures.lock().unwrap().dial_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fails(|f| f.dial) {
            return Err(broker_error());
        }

        Ok(FakeConnection {
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    type Channel = FakeChannel;

    async fn open_channel(&self) -> BrokerResult<FakeChannel> {
        self.state.record(Call::OpenChannel);
        if self.state.fails(|f| f.open_channel) {
            return Err(broker_error());
        }

        Ok(FakeChannel {
            state: Arc::clone(&self.state),
        })
    }

    async fn close(&self, _reply_code: u16, _reply_text: &str) -> BrokerResult<()> {
        self.state.record(Call::ConnectionClose);
        if self.state.fails(|f| f.connection_close) {
            return Err(broker_error());
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn qos(&self, prefetch_count: u16, options: BasicQosOptions) -> BrokerResult<()> {
        self.state.record(Call::Qos {
            prefetch: prefetch_count,
            global: options.global,
        });
        if self.state.fails(|f| f.qos) {
            return Err(broker_error());
        }
        Ok(())
    }

    fn notify_close(&self) -> mpsc::UnboundedReceiver<CloseEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.close_notifier.lock().unwrap() = Some(tx);
        rx
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> BrokerResult<QueueInfo> {
        self.state.record(Call::QueueDeclare {
            name: name.to_string(),
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            nowait: options.nowait,
        });
        if self.state.fails(|f| f.queue_declare) {
            return Err(broker_error());
        }

        Ok(QueueInfo {
            name: name.to_string(),
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        _arguments: FieldTable,
    ) -> BrokerResult<RawConsumer> {
        self.state.record(Call::Consume {
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            no_ack: options.no_ack,
            exclusive: options.exclusive,
        });
        if self.state.fails(|f| f.consume) {
            return Err(broker_error());
        }

        let rx = self
            .state
            .delivery_rx
            .lock()
            .unwrap()
            .take()
            .expect("fake broker supports a single consumer");

        Ok(RawConsumer {
            tag: consumer_tag.to_string(),
            deliveries: rx.boxed(),
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
        self.state.record(Call::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: options.mandatory,
            immediate: options.immediate,
            body: body.to_vec(),
            properties,
        });
        if self.state.fails(|f| f.publish) {
            return Err(broker_error());
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.state.record(Call::Cancel(consumer_tag.to_string()));
        if self.state.fails(|f| f.cancel) {
            return Err(broker_error());
        }
        Ok(())
    }

    async fn close(&self, _reply_code: u16, _reply_text: &str) -> BrokerResult<()> {
        self.state.record(Call::ChannelClose);
        self.state.close_notifier.lock().unwrap().take();
        if self.state.fails(|f| f.channel_close) {
            return Err(broker_error());
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self, options: BasicAckOptions) -> BrokerResult<()> {
        self.state.record(Call::Ack {
            tag: self.tag,
            multiple: options.multiple,
        });
        Ok(())
    }

    async fn nack(&self, options: BasicNackOptions) -> BrokerResult<()> {
        self.state.record(Call::Nack {
            tag: self.tag,
            multiple: options.multiple,
            requeue: options.requeue,
        });
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
