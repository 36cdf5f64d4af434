use chrono::{DateTime, Utc};
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::BasicProperties;
use serde::de::{value::Error as ValueError, DeserializeOwned, IntoDeserializer};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::broker::{Acknowledger, Delivery};
use crate::errors::{ClientError, DecodeError, Result};

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// No delivery mode on the wire; the broker treats the message as transient
    #[default]
    Unset,
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP encoding: 1 transient, 2 persistent, 0 when unset.
    pub fn wire(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
            DeliveryMode::Unset => 0,
        }
    }

    pub fn from_wire(mode: Option<u8>) -> Self {
        match mode {
            Some(2) => DeliveryMode::Persistent,
            _ => DeliveryMode::Transient,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub content_type: String,
    pub content_encoding: String,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    /// Zero means the message never expires
    pub expiration: Duration,
}

impl MessageHeader {
    pub fn json() -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Build the publish properties for this header, stamped with `timestamp`
    /// (seconds since the epoch).
    pub fn to_properties(&self, timestamp: u64) -> BasicProperties {
        let mut properties = BasicProperties::default().with_timestamp(timestamp);

        if !self.content_type.is_empty() {
            properties = properties.with_content_type(self.content_type.as_str().into());
        }
        if !self.content_encoding.is_empty() {
            properties = properties.with_content_encoding(self.content_encoding.as_str().into());
        }

        let delivery_mode = self.delivery_mode.wire();
        if delivery_mode != 0 {
            properties = properties.with_delivery_mode(delivery_mode);
        }
        if self.priority > 0 {
            properties = properties.with_priority(self.priority);
        }
        if !self.expiration.is_zero() {
            properties =
                properties.with_expiration(expiration_millis(self.expiration).to_string().into());
        }

        properties
    }

    fn from_properties(properties: &BasicProperties) -> Self {
        Self {
            content_type: properties
                .content_type()
                .as_ref()
                .map(|value| value.as_str().to_string())
                .unwrap_or_default(),
            content_encoding: properties
                .content_encoding()
                .as_ref()
                .map(|value| value.as_str().to_string())
                .unwrap_or_default(),
            delivery_mode: DeliveryMode::from_wire(*properties.delivery_mode()),
            priority: properties.priority().unwrap_or(0),
            expiration: properties
                .expiration()
                .as_ref()
                .and_then(|value| value.as_str().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or_default(),
        }
    }
}

/// Whole milliseconds, rounded to nearest.
pub fn expiration_millis(expiration: Duration) -> u128 {
    (expiration.as_nanos() + 500_000) / 1_000_000
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    Rejected,
    Requeued,
}

/// A received message, still bound to the delivery it came from.
///
/// When the subscription runs with auto-ack the broker has already settled
/// the delivery, and `acknowledge`, `reject` and `requeue` do nothing.
/// Otherwise the first successful call settles the delivery and any later
/// call is a no-op.
pub struct Message {
    pub timestamp: Option<DateTime<Utc>>,
    pub header: MessageHeader,
    pub body: Vec<u8>,
    delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
    ack_required: bool,
    settled: Option<Disposition>,
}

impl Message {
    pub fn from_delivery(delivery: Delivery, ack_required: bool) -> Self {
        Self {
            timestamp: delivery
                .properties
                .timestamp()
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
            header: MessageHeader::from_properties(&delivery.properties),
            body: delivery.body,
            delivery_tag: delivery.delivery_tag,
            acker: delivery.acker,
            ack_required,
            settled: None,
        }
    }

    pub fn should_ack(&self) -> bool {
        self.ack_required
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn disposition(&self) -> Option<Disposition> {
        self.settled
    }

    /// Acknowledge the successful processing of a message.
    pub async fn acknowledge(&mut self) -> Result<()> {
        self.settle(Disposition::Acknowledged).await
    }

    /// Reject a message, but don't requeue it.
    pub async fn reject(&mut self) -> Result<()> {
        self.settle(Disposition::Rejected).await
    }

    /// Reject a message and requeue it.
    pub async fn requeue(&mut self) -> Result<()> {
        self.settle(Disposition::Requeued).await
    }

    async fn settle(&mut self, disposition: Disposition) -> Result<()> {
        if !self.ack_required {
            return Ok(());
        }
        if let Some(previous) = self.settled {
            debug!(
                delivery_tag = self.delivery_tag,
                ?previous,
                requested = ?disposition,
                "Delivery already settled"
            );
            return Ok(());
        }

        let result = match disposition {
            Disposition::Acknowledged => self.acker.ack(BasicAckOptions { multiple: false }).await,
            Disposition::Rejected => {
                self.acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
            }
            Disposition::Requeued => {
                self.acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await
            }
        };
        result.map_err(ClientError::Ack)?;

        self.settled = Some(disposition);
        Ok(())
    }

    /// Decode the body into `T`.
    ///
    /// `application/json` bodies are parsed as JSON. Anything else is treated
    /// as text and handed to `T` as a single string value, so `String` and
    /// unit enum variants decode while numbers and structs are rejected.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, DecodeError> {
        if self.header.content_type == JSON_CONTENT_TYPE {
            return Ok(serde_json::from_slice(&self.body)?);
        }

        let text = std::str::from_utf8(&self.body)?;
        let deserializer: serde::de::value::StrDeserializer<'_, ValueError> =
            text.into_deserializer();
        T::deserialize(deserializer).map_err(|e| DecodeError::Unsupported(e.to_string()))
    }

    /// Copy as much of a non-JSON body as fits into `buf`, returning the
    /// number of bytes copied.
    pub fn copy_into(&self, buf: &mut [u8]) -> std::result::Result<usize, DecodeError> {
        if self.header.content_type == JSON_CONTENT_TYPE {
            return Err(DecodeError::Unsupported(
                "a byte buffer cannot receive a JSON document".to_string(),
            ));
        }

        let n = buf.len().min(self.body.len());
        if n == 0 && !self.body.is_empty() {
            return Err(DecodeError::BufferTooSmall {
                needed: self.body.len(),
            });
        }

        buf[..n].copy_from_slice(&self.body[..n]);
        Ok(n)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("timestamp", &self.timestamp)
            .field("header", &self.header)
            .field("body_len", &self.body.len())
            .field("delivery_tag", &self.delivery_tag)
            .field("ack_required", &self.ack_required)
            .field("settled", &self.settled)
            .finish()
    }
}
