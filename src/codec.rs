//! Envelope codec.
//!
//! Every record on the bus is a flat `string -> string` map. The codec turns that map
//! into bytes for the backing store and back. Decoding is lenient about scalar types so
//! producers that emit numbers or booleans interoperate: scalars are stringified,
//! nulls dropped, nested values kept as JSON text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Message payload as seen by consumers.
pub type Payload = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("Envelope is not a map")]
    NotAMap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    #[serde(alias = "messagepack", alias = "msg_pack")]
    MsgPack,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    format: WireFormat,
}

impl EnvelopeCodec {
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn encode(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        match self.format {
            WireFormat::Json => Ok(serde_json::to_vec(payload)?),
            WireFormat::MsgPack => Ok(rmp_serde::to_vec(payload)?),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        let raw: Value = match self.format {
            WireFormat::Json => serde_json::from_slice(bytes)?,
            WireFormat::MsgPack => rmp_serde::from_slice(bytes)?,
        };
        normalize(raw)
    }
}

fn normalize(raw: Value) -> Result<Payload, CodecError> {
    let Value::Object(map) = raw else {
        return Err(CodecError::NotAMap);
    };

    let mut payload = Payload::new();
    for (key, value) in map {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            nested @ (Value::Array(_) | Value::Object(_)) => nested.to_string(),
        };
        payload.insert(key, text);
    }
    Ok(payload)
}
