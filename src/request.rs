//! Email send requests and their queue wire form.
//!
//! The payload is a UTF-8 JSON object:
//! `{"fromaddr": "...", "toaddrs": "a@x.com,b@x.com", "body": "...", "subject": "..."}`
//! with `subject` optional.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::binder::{Bindable, Parameter};
use crate::error::{BindingError, ConfigError};

/// Table of a message file holding the request fields.
pub const MESSAGE_SECTION: &str = "email";

/// One email to send, as published to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRequest {
    pub fromaddr: String,
    /// Recipients, comma-separated when there is more than one.
    pub toaddrs: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl EmailRequest {
    pub fn new(
        fromaddr: impl Into<String>,
        toaddrs: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            fromaddr: fromaddr.into(),
            toaddrs: toaddrs.into(),
            body: body.into(),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Serialize to the queue payload.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl Bindable for EmailRequest {
    const PARAMETERS: &'static [Parameter] = &[
        Parameter::required("fromaddr"),
        Parameter::required("toaddrs"),
        Parameter::required("body"),
        Parameter::optional("subject"),
    ];
}

/// Decode a queue payload into a named-argument mapping.
///
/// Only the outer shape is checked here; field names and types are the
/// binder's concern.
pub fn decode_payload(payload: &[u8]) -> Result<Map<String, Value>, BindingError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(BindingError::MalformedPayload(format!(
            "expected a JSON object, found {}",
            json_type(&other)
        ))),
        Err(e) => Err(BindingError::MalformedPayload(e.to_string())),
    }
}

/// Read the `[email]` table of a TOML message file as named arguments.
///
/// Keys are passed through untouched; spelling and completeness are checked
/// when the mapping is bound.
pub fn load_message_file(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut doc = toml::from_str::<toml::Table>(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let section = match doc.remove(MESSAGE_SECTION) {
        Some(toml::Value::Table(section)) => section,
        _ => {
            return Err(ConfigError::InvalidValue {
                key: MESSAGE_SECTION.into(),
                message: format!("{} has no [{MESSAGE_SECTION}] section", path.display()),
            });
        }
    };

    match serde_json::to_value(section) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ConfigError::InvalidValue {
            key: MESSAGE_SECTION.into(),
            message: format!("expected a table, found {}", json_type(&other)),
        }),
        Err(e) => Err(ConfigError::InvalidValue {
            key: MESSAGE_SECTION.into(),
            message: e.to_string(),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
