//! Pluggable envelope codec. The default is the JSON short-field shape.

use crate::protocol::InvokeMessage;

#[derive(Clone, Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid envelope: {0}")]
    Invalid(String),
    #[error("frame is not valid utf-8")]
    NotUtf8,
}

impl From<serde_json::Error> for FormatError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(e.to_string())
    }
}

/// Encode/decode between an envelope and a transport text payload.
pub trait MessageFormatter: Send + Sync {
    fn encode(&self, message: &InvokeMessage) -> Result<String, FormatError>;
    fn decode(&self, text: &str) -> Result<InvokeMessage, FormatError>;
}

/// Default JSON codec over the `M`/`D`/`A`/`R` envelope shape.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonFormatter;

impl MessageFormatter for JsonFormatter {
    fn encode(&self, message: &InvokeMessage) -> Result<String, FormatError> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(&self, text: &str) -> Result<InvokeMessage, FormatError> {
        Ok(serde_json::from_str(text)?)
    }
}
