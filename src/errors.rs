// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid connection URI: {0}")]
    InvalidUri(String),

    #[error("connection does not exist")]
    NotConnected,

    #[error("client is already connected")]
    AlreadyConnected,

    #[error("no queue has been declared on this connection")]
    NoQueue,

    #[error("a subscription is already running on this client")]
    AlreadySubscribed,

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("RabbitMQ connection error: {0}")]
    Connection(#[source] LapinError),

    #[error("RabbitMQ channel error: {0}")]
    Channel(#[source] LapinError),

    #[error("failed to apply QoS: {0}")]
    Qos(#[source] LapinError),

    #[error("failed to declare queue: {0}")]
    QueueDeclare(#[source] LapinError),

    #[error("RabbitMQ consume error: {0}")]
    Consume(#[source] LapinError),

    #[error("RabbitMQ publish error: {0}")]
    Publish(#[source] LapinError),

    #[error("RabbitMQ acknowledge error: {0}")]
    Ack(#[source] LapinError),

    #[error("failed to cancel consumer: {0}")]
    Cancel(#[source] LapinError),

    #[error("failed to close channel: {0}")]
    ChannelClose(#[source] LapinError),

    #[error("failed to close connection: {0}")]
    ConnectionClose(#[source] LapinError),

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{}", join_errors(.0))]
    Teardown(Vec<ClientError>),
}

impl ClientError {
    /// Every failure carried by this error, flattening a teardown composite.
    pub fn causes(&self) -> Vec<&ClientError> {
        match self {
            ClientError::Teardown(errors) => errors.iter().collect(),
            other => vec![other],
        }
    }
}

fn join_errors(errors: &[ClientError]) -> String {
    match errors.len() {
        0 => "no errors".to_string(),
        1 => errors[0].to_string(),
        n => {
            let listed: Vec<String> = errors.iter().map(|e| format!("* {}", e)).collect();
            format!("{} errors occurred:\n\t{}", n, listed.join("\n\t"))
        }
    }
}

/// Asynchronous channel closure, as delivered on the client's error channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloseError {
    #[error("server error {code}: {reason}")]
    Server { code: u16, reason: String },

    #[error("client error {code}: {reason}")]
    Client { code: u16, reason: String },
}

impl CloseError {
    pub fn code(&self) -> u16 {
        match self {
            CloseError::Server { code, .. } | CloseError::Client { code, .. } => *code,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            CloseError::Server { reason, .. } | CloseError::Client { reason, .. } => reason,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, CloseError::Server { .. })
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] SerdeError),

    #[error("target must be able to hold at least {needed} bytes")]
    BufferTooSmall { needed: usize },

    #[error("unsupported decode target: {0}")]
    Unsupported(String),

    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
