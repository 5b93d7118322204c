//! Event payload model.
//!
//! Wire payloads are JSON, but event data may carry raw binary blobs that
//! travel as separate frames. [`Value`] is the in-memory superset: JSON
//! plus a `Binary` variant. Encoding walks the tree, swaps each blob for a
//! `{"_placeholder":true,"num":i}` node and collects the blobs in order;
//! decoding performs the symmetric walk once all attachments have arrived.
//! Both walks are depth-limited so hostile input cannot blow the stack.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Number;

use crate::error::DecodeError;

/// Maximum nesting depth accepted by the placeholder walks.
const MAX_DEPTH: usize = 64;

/// A structured event value: JSON extended with raw binary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Binary(Bytes),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// True if any node in the tree is binary, i.e. the packet must go out
    /// as BINARY_EVENT / BINARY_ACK.
    pub fn has_binary(&self) -> bool {
        match self {
            Value::Binary(_) => true,
            Value::Array(items) => items.iter().any(Value::has_binary),
            Value::Object(map) => map.values().any(Value::has_binary),
            _ => false,
        }
    }

    /// Convert to wire JSON, appending each binary blob to `attachments`
    /// and leaving a placeholder node in its place.
    pub fn to_wire(&self, attachments: &mut Vec<Bytes>) -> Result<serde_json::Value, DecodeError> {
        self.to_wire_at(attachments, 0)
    }

    fn to_wire_at(
        &self,
        attachments: &mut Vec<Bytes>,
        depth: usize,
    ) -> Result<serde_json::Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::DepthExceeded);
        }
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(bytes) => {
                let num = attachments.len();
                attachments.push(bytes.clone());
                serde_json::json!({ "_placeholder": true, "num": num })
            }
            Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| v.to_wire_at(attachments, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_wire_at(attachments, depth + 1)?)))
                    .collect::<Result<_, DecodeError>>()?,
            ),
        })
    }

    /// Rebuild a value from wire JSON, resolving placeholder nodes against
    /// the received attachments. A placeholder index outside the attachment
    /// list is an [`DecodeError::AttachmentMismatch`].
    pub fn from_wire(json: &serde_json::Value, attachments: &[Bytes]) -> Result<Self, DecodeError> {
        Self::from_wire_at(json, attachments, 0)
    }

    fn from_wire_at(
        json: &serde_json::Value,
        attachments: &[Bytes],
        depth: usize,
    ) -> Result<Self, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::DepthExceeded);
        }
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| Self::from_wire_at(v, attachments, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => {
                if let Some(num) = placeholder_index(map) {
                    let bytes = attachments
                        .get(num)
                        .ok_or(DecodeError::AttachmentMismatch)?;
                    Value::Binary(bytes.clone())
                } else {
                    Value::Object(
                        map.iter()
                            .map(|(k, v)| {
                                Ok((k.clone(), Self::from_wire_at(v, attachments, depth + 1)?))
                            })
                            .collect::<Result<_, DecodeError>>()?,
                    )
                }
            }
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }
}

fn placeholder_index(map: &serde_json::Map<String, serde_json::Value>) -> Option<usize> {
    if map.get("_placeholder").and_then(|v| v.as_bool()) != Some(true) {
        return None;
    }
    map.get("num").and_then(|v| v.as_u64()).map(|n| n as usize)
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(b))
    }
}
