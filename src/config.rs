// src/config.rs
use anyhow::{anyhow, Context, Result};
use lapin::types::{AMQPValue, FieldTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::params::{ConnectionParams, DEFAULT_QUEUE_NAME};

/// Client settings as stored in `qcat.json` or the `QCAT_*` environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub uri: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub autodelete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub immediate: bool,
    #[serde(default = "default_auto_ack")]
    pub auto_ack: bool,
    #[serde(default)]
    pub prefetch: u16,
    #[serde(default = "default_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub heartbeat_seconds: u16,
    /// Queue arguments, e.g. `{"x-message-ttl": 60000}`
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
}

// Default values
fn default_queue() -> String { DEFAULT_QUEUE_NAME.to_string() }
fn default_auto_ack() -> bool { true }
fn default_timeout() -> u64 { 5000 }

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file at {}", path.display()))?;

        let config: ClientConfig = serde_json::from_str(&content)
            .context("Configuration file contains invalid JSON or missing required fields")?;
        config.validate()?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Read `QCAT_*` variables, after loading a `.env` file if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let config = ClientConfig {
            uri: env::var("QCAT_URI").context("QCAT_URI must be set")?,
            id: env::var("QCAT_ID").ok(),
            exchange: env::var("QCAT_EXCHANGE").unwrap_or_default(),
            routing_key: env::var("QCAT_ROUTING_KEY").unwrap_or_default(),
            queue: env::var("QCAT_QUEUE").unwrap_or_else(|_| default_queue()),
            durable: env_flag("QCAT_DURABLE", false)?,
            autodelete: env_flag("QCAT_AUTODELETE", false)?,
            exclusive: env_flag("QCAT_EXCLUSIVE", false)?,
            mandatory: env_flag("QCAT_MANDATORY", false)?,
            immediate: env_flag("QCAT_IMMEDIATE", false)?,
            auto_ack: env_flag("QCAT_AUTO_ACK", default_auto_ack())?,
            prefetch: match env::var("QCAT_PREFETCH") {
                Ok(val) => val.parse().context("QCAT_PREFETCH must be a number")?,
                Err(_) => 0,
            },
            connect_timeout_ms: match env::var("QCAT_CONNECT_TIMEOUT_MS") {
                Ok(val) => val.parse().context("QCAT_CONNECT_TIMEOUT_MS must be a number")?,
                Err(_) => default_timeout(),
            },
            heartbeat_seconds: match env::var("QCAT_HEARTBEAT_SECONDS") {
                Ok(val) => val.parse().context("QCAT_HEARTBEAT_SECONDS must be a number")?,
                Err(_) => 0,
            },
            headers: BTreeMap::new(),
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.uri.is_empty() {
            return Err(anyhow!("Configuration error: uri cannot be empty"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn into_params(self) -> Result<ConnectionParams> {
        let mut params = ConnectionParams::from_uri(&self.uri)
            .context("Configuration error: uri is not a valid AMQP URI")?;

        if let Some(id) = self.id {
            params.id = id;
        }
        params.exchange_name = self.exchange;
        params.routing_key = self.routing_key;
        params.queue_name = self.queue;
        params.durable = self.durable;
        params.autodelete = self.autodelete;
        params.exclusive = self.exclusive;
        params.mandatory = self.mandatory;
        params.immediate = self.immediate;
        params.auto_ack = self.auto_ack;
        params.prefetch = self.prefetch;
        params.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        params.heartbeat_interval = Duration::from_secs(self.heartbeat_seconds.into());
        params.headers = self
            .headers
            .iter()
            .map(|(key, value)| (key.clone(), json_to_amqp(value)))
            .collect();

        Ok(params)
    }
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(anyhow!("{} must be a boolean, got '{}'", name, val)),
        },
        Err(_) => Ok(default),
    }
}

/// Convert a JSON value into the closest AMQP field value.
pub fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        Value::Array(items) => {
            AMQPValue::FieldArray(items.iter().map(json_to_amqp).collect::<Vec<_>>().into())
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, item) in map {
                table.insert(key.clone().into(), json_to_amqp(item));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", Path::new("qcat.json")),
        ("Current directory (alternative)", Path::new("config/qcat.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".qcat.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find qcat.json configuration file. \
         Please create one in the current directory or your home directory."
    ))
}

/// Locate and load the configuration file.
pub fn load_config() -> Result<ClientConfig> {
    let path = find_config_file()?;
    let config = ClientConfig::load(&path)?;
    info!("Using configuration from {}", path.display());
    Ok(config)
}
