//! Named-argument binding.
//!
//! Turns a loosely-typed mapping (a decoded queue payload, or CLI flags) into
//! the typed parameters of an operation. Keys are matched by name after
//! replacing `-` with `_`, so `--from-addr` style and `from_addr` style
//! spellings bind the same parameter. A missing required parameter or a key
//! that names no parameter is an error; nothing is silently dropped or
//! defaulted.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::BindingError;

/// One declared parameter of a bindable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    pub name: &'static str,
    pub required: bool,
}

impl Parameter {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// The parameter list of an operation.
///
/// Implementors deserialize from the bound mapping, so every parameter name
/// must match a serde field name and optional parameters must be
/// `Option<_>` or `#[serde(default)]`.
pub trait Bindable: DeserializeOwned {
    const PARAMETERS: &'static [Parameter];

    fn parameter(name: &str) -> Option<&'static Parameter> {
        Self::PARAMETERS.iter().find(|p| p.name == name)
    }
}

/// Flag-style to field-style key spelling.
pub fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
}

/// Bind `args` to the parameters of `P`.
pub fn bind<P: Bindable>(args: Map<String, Value>) -> Result<P, BindingError> {
    let args: Map<String, Value> = args
        .into_iter()
        .map(|(key, value)| (normalize_key(&key), value))
        .collect();

    if let Some(missing) = P::PARAMETERS
        .iter()
        .find(|p| p.required && !args.contains_key(p.name))
    {
        return Err(BindingError::Missing(missing.name.to_string()));
    }

    if let Some(unexpected) = args.keys().find(|key| P::parameter(key).is_none()) {
        return Err(BindingError::Unexpected(unexpected.clone()));
    }

    serde_json::from_value(Value::Object(args))
        .map_err(|e| BindingError::InvalidArgument(e.to_string()))
}

/// Bind `args` and invoke `operation` with the result.
///
/// Whatever `operation` returns, errors included, is handed back unchanged.
pub fn bind_and_call<P, R, F>(operation: F, args: Map<String, Value>) -> Result<R, BindingError>
where
    P: Bindable,
    F: FnOnce(P) -> R,
{
    let params = bind::<P>(args)?;
    Ok(operation(params))
}
