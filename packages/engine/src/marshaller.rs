//! Conversion between typed messages and wire text.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::EngineResult;

/// Encodes and decodes JSON values to and from wire text.
///
/// Typed helpers live on `dyn Marshaller` so implementations only deal with
/// [`Value`].
pub trait Marshaller: Send + Sync + 'static {
    fn encode_value(&self, value: &Value) -> EngineResult<String>;

    fn decode_value(&self, text: &str) -> EngineResult<Value>;
}

impl dyn Marshaller {
    /// Marshal any serializable message.
    pub fn marshal<T: Serialize>(&self, message: &T) -> EngineResult<String> {
        let value = serde_json::to_value(message)?;
        self.encode_value(&value)
    }

    /// Unmarshal wire text into a typed message.
    pub fn unmarshal<T: DeserializeOwned>(&self, text: &str) -> EngineResult<T> {
        let value = self.decode_value(text)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Compact JSON marshaller.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMarshaller {
    pretty: bool,
}

impl JsonMarshaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretty-print output (used for files meant to be read by people).
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl Marshaller for JsonMarshaller {
    fn encode_value(&self, value: &Value) -> EngineResult<String> {
        if self.pretty {
            Ok(serde_json::to_string_pretty(value)?)
        } else {
            Ok(serde_json::to_string(value)?)
        }
    }

    fn decode_value(&self, text: &str) -> EngineResult<Value> {
        Ok(serde_json::from_str(text)?)
    }
}
