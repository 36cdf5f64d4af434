// src/params.rs
// Connection parameters parsed from an AMQP URI

use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPScheme, AMQPUri};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{DialConfig, TlsConfig};
use crate::errors::{ClientError, Result};

pub const DEFAULT_QUEUE_NAME: &str = "qcat";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client name advertised in the `product` connection property
pub const PRODUCT: &str = "qcat";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything needed to dial the broker and set up the channel and queue.
///
/// Built once from a connection URI with [`ConnectionParams::from_uri`]; the
/// fields may then be adjusted freely until the client connects.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Client identity, used as the consumer tag and the connection name
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub connect_timeout: Duration,
    /// Zero keeps whatever the URI (or the broker) negotiates
    pub heartbeat_interval: Duration,
    pub tls: Option<TlsConfig>,
    pub exchange_name: String,
    pub routing_key: String,
    pub queue_name: String,
    pub durable: bool,
    pub autodelete: bool,
    pub exclusive: bool,
    pub mandatory: bool,
    pub immediate: bool,
    pub auto_ack: bool,
    pub prefetch: u16,
    /// Arguments passed to queue declaration and consumption
    pub headers: BTreeMap<String, AMQPValue>,
    /// Client properties sent during the connection handshake
    pub client_properties: BTreeMap<String, AMQPValue>,
    uri: AMQPUri,
}

impl ConnectionParams {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let parsed: AMQPUri = uri.parse().map_err(ClientError::InvalidUri)?;

        Ok(Self {
            id: default_id(),
            host: parsed.authority.host.clone(),
            port: parsed.authority.port,
            username: parsed.authority.userinfo.username.clone(),
            password: parsed.authority.userinfo.password.clone(),
            vhost: parsed.vhost.clone(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: Duration::ZERO,
            tls: None,
            exchange_name: String::new(),
            routing_key: String::new(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            durable: false,
            autodelete: false,
            exclusive: false,
            mandatory: false,
            immediate: false,
            auto_ack: true,
            prefetch: 0,
            headers: BTreeMap::new(),
            client_properties: BTreeMap::new(),
            uri: parsed,
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.uri.scheme, AMQPScheme::AMQPS) || self.tls.is_some()
    }

    /// Fill in the `product`, `version` and `hostname` client properties,
    /// leaving any value the caller already supplied untouched.
    pub fn ensure_client_properties(&mut self) {
        if !self.client_properties.contains_key("product") {
            self.client_properties
                .insert("product".to_string(), long_string(PRODUCT));
            self.client_properties
                .insert("version".to_string(), long_string(VERSION));
        }

        if !self.client_properties.contains_key("hostname") {
            match hostname::get().ok().and_then(|h| h.into_string().ok()) {
                Some(name) => {
                    self.client_properties
                        .insert("hostname".to_string(), long_string(&name));
                }
                None => debug!("Local hostname is not resolvable, leaving it unset"),
            }
        }
    }

    /// The URI actually dialed: the parsed one with the current field values
    /// and timing settings applied.
    pub fn dial_uri(&self) -> AMQPUri {
        let mut uri = self.uri.clone();
        uri.authority.host = self.host.clone();
        uri.authority.port = self.port;
        uri.authority.userinfo.username = self.username.clone();
        uri.authority.userinfo.password = self.password.clone();
        uri.vhost = self.vhost.clone();

        if !self.heartbeat_interval.is_zero() {
            let secs = self.heartbeat_interval.as_secs().clamp(1, u16::MAX as u64);
            uri.query.heartbeat = Some(secs as u16);
        }
        if !self.connect_timeout.is_zero() {
            uri.query.connection_timeout = Some(self.connect_timeout.as_millis() as u64);
        }

        uri
    }

    pub fn dial_config(&self) -> DialConfig {
        DialConfig {
            uri: self.dial_uri(),
            connection_name: self.id.clone(),
            client_properties: to_field_table(&self.client_properties),
            tls: self.tls.clone(),
        }
    }
}

fn default_id() -> String {
    format!("{}-{}", PRODUCT, &Uuid::new_v4().simple().to_string()[..8])
}

pub(crate) fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(value.to_string().into())
}

pub(crate) fn to_field_table(map: &BTreeMap<String, AMQPValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(key.clone().into(), value.clone());
    }
    table
}
