//! Layered configuration.
//!
//! A [`Configuration`] is a flat, string-keyed table assembled once at startup
//! from three layers, later layers winning key by key:
//!
//! 1. built-in defaults ([`Configuration::defaults`])
//! 2. an optional override file: top-level UPPERCASE keys of a TOML document
//! 3. an optional broker-credentials file: TOML sections such as
//!    `[connection_parameters]`, `[credentials]` and `[queue_bind]`, stored as
//!    nested tables under their section name
//!
//! Absent optional files are skipped. Files that exist but cannot be read or
//! parsed are fatal. After assembly the value is only read, through the typed
//! views [`BrokerSettings`] and [`SmtpSettings`].

use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use toml::{Table, Value};

use crate::error::ConfigError;

/// Default location of the override file.
pub const DEFAULT_CONFIG_PATH: &str = "instance/config.toml";
/// Default location of the broker-credentials file.
pub const DEFAULT_RABBITMQ_CONFIG_PATH: &str = "instance/rabbitmq.toml";

pub const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const SMTP_HOST: &str = "SMTP_HOST";
pub const SMTP_PORT: &str = "SMTP_PORT";
pub const QUEUE: &str = "QUEUE";
pub const DRYRUN: &str = "DRYRUN";
pub const LOG_FILTER: &str = "LOG_FILTER";

pub const CONNECTION_PARAMETERS: &str = "connection_parameters";
pub const CREDENTIALS: &str = "credentials";
pub const QUEUE_BIND: &str = "queue_bind";

const DEFAULT_AMQP_PORT: u16 = 5672;
const DEFAULT_SMTP_PORT: u16 = 25;
const DEFAULT_VIRTUAL_HOST: &str = "/";
const DEFAULT_BROKER_USER: &str = "guest";

/// Immutable, assembled configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    values: Table,
    sources: Vec<PathBuf>,
}

impl Configuration {
    /// Built-in defaults: broker and SMTP on localhost, queue `emails`.
    pub fn defaults() -> Self {
        let mut values = Table::new();
        values.insert(RABBITMQ_HOST.into(), Value::String("localhost".into()));
        values.insert(SMTP_HOST.into(), Value::String("localhost".into()));
        values.insert(SMTP_PORT.into(), Value::Integer(DEFAULT_SMTP_PORT.into()));
        values.insert(QUEUE.into(), Value::String("emails".into()));
        values.insert(DRYRUN.into(), Value::Boolean(false));
        Self {
            values,
            sources: Vec::new(),
        }
    }

    /// Layer the optional override and credentials files over `defaults`.
    pub fn assemble(
        defaults: Configuration,
        override_path: Option<&Path>,
        credentials_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut config = defaults;

        if let Some(path) = override_path {
            if let Some(doc) = read_layer(path)? {
                config.apply_overrides(doc);
                config.sources.push(path.to_path_buf());
            }
        }

        if let Some(path) = credentials_path {
            if let Some(doc) = read_layer(path)? {
                config.apply_credentials(doc);
                config.sources.push(path.to_path_buf());
            }
        }

        Ok(config)
    }

    fn apply_overrides(&mut self, doc: Table) {
        for (key, value) in doc {
            if is_uppercase_key(&key) {
                self.values.insert(key, value);
            }
        }
    }

    fn apply_credentials(&mut self, doc: Table) {
        for (section, value) in doc {
            self.values.insert(section, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Files that were found and layered in, in the order applied.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Set a value while the configuration is still being put together,
    /// e.g. from a command-line flag.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Optional `tracing_subscriber::EnvFilter` directive.
    pub fn log_filter(&self) -> Result<Option<String>, ConfigError> {
        string_value(LOG_FILTER, self.get(LOG_FILTER))
    }

    /// Broker connection and queue topology.
    pub fn broker_settings(&self) -> Result<BrokerSettings, ConfigError> {
        let host = match self.section_string(CONNECTION_PARAMETERS, "host")? {
            Some(host) => host,
            None => self.require_string(RABBITMQ_HOST)?,
        };
        let port = match self.section(CONNECTION_PARAMETERS)?.and_then(|s| s.get("port")) {
            Some(value) => port_value("connection_parameters.port", value)?,
            None => DEFAULT_AMQP_PORT,
        };
        let virtual_host = self
            .section_string(CONNECTION_PARAMETERS, "virtual_host")?
            .unwrap_or_else(|| DEFAULT_VIRTUAL_HOST.to_string());
        let username = self
            .section_string(CREDENTIALS, "username")?
            .unwrap_or_else(|| DEFAULT_BROKER_USER.to_string());
        let password = self
            .section_string(CREDENTIALS, "password")?
            .unwrap_or_else(|| DEFAULT_BROKER_USER.to_string());

        let queue = match self.section_string(QUEUE_BIND, "queue")? {
            Some(queue) => queue,
            None => self.require_string(QUEUE)?,
        };
        let exchange = self
            .section_string(QUEUE_BIND, "exchange")?
            .filter(|e| !e.is_empty());
        let routing_key = self
            .section_string(QUEUE_BIND, "routing_key")?
            .unwrap_or_else(|| queue.clone());

        Ok(BrokerSettings {
            host,
            port,
            virtual_host,
            username,
            password: SecretString::from(password),
            queue,
            exchange,
            routing_key,
        })
    }

    /// SMTP endpoint and dry-run switch.
    pub fn smtp_settings(&self) -> Result<SmtpSettings, ConfigError> {
        let host = self.require_string(SMTP_HOST)?;
        let port = match self.get(SMTP_PORT) {
            Some(value) => port_value(SMTP_PORT, value)?,
            None => DEFAULT_SMTP_PORT,
        };
        let dry_run = match self.get(DRYRUN) {
            Some(value) => bool_value(DRYRUN, value)?,
            None => false,
        };
        Ok(SmtpSettings {
            host,
            port,
            dry_run,
        })
    }

    fn require_string(&self, key: &str) -> Result<String, ConfigError> {
        string_value(key, self.get(key))?.ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: "missing".into(),
        })
    }

    fn section(&self, name: &str) -> Result<Option<&Table>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Table(table)) => Ok(Some(table)),
            Some(other) => Err(ConfigError::InvalidValue {
                key: name.to_string(),
                message: format!("expected a section, found {}", other.type_str()),
            }),
        }
    }

    fn section_string(&self, section: &str, key: &str) -> Result<Option<String>, ConfigError> {
        let value = self.section(section)?.and_then(|s| s.get(key));
        string_value(&format!("{section}.{key}"), value)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Typed view of the broker-related keys.
#[derive(Debug)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: SecretString,
    pub queue: String,
    /// Named exchange the queue is bound to. `None` means the default exchange.
    pub exchange: Option<String>,
    pub routing_key: String,
}

/// Typed view of the SMTP-related keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub dry_run: bool,
}

/// Python-style `isupper`: at least one cased character and no lowercase ones.
fn is_uppercase_key(key: &str) -> bool {
    key.chars().any(char::is_alphabetic) && !key.chars().any(char::is_lowercase)
}

/// Read one optional layer. A missing file yields `None`.
fn read_layer(path: &Path) -> Result<Option<Table>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let table = toml::from_str::<Table>(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Some(table))
}

fn string_value(key: &str, value: Option<&Value>) -> Result<Option<String>, ConfigError> {
    match value {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Integer(i)) => Ok(Some(i.to_string())),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a string, found {}", other.type_str()),
        }),
    }
}

fn port_value(key: &str, value: &Value) -> Result<u16, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };
    match value {
        Value::Integer(i) => u16::try_from(*i).map_err(|_| invalid(format!("{i} is not a port"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'{s}' is not a port"))),
        other => Err(invalid(format!("expected a port, found {}", other.type_str()))),
    }
}

/// Booleans may also be spelled the INI way (`yes`/`no`, `on`/`off`, `1`/`0`).
fn bool_value(key: &str, value: &Value) -> Result<bool, ConfigError> {
    match value {
        Value::Boolean(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{s}' is not a boolean"),
            }),
        },
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, found {}", other.type_str()),
        }),
    }
}
