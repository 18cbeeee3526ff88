use std::borrow::Cow;

use anyhow::Context;

use crate::{config::ReadMode, pool::BufferPool};

/// A cached payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    /// The bytes that go on disk: raw payloads as they are, JSON serialized.
    pub fn encode(&self) -> anyhow::Result<Cow<'_, [u8]>> {
        match self {
            Value::Bytes(b) => Ok(Cow::Borrowed(b)),
            Value::Json(v) => Ok(Cow::Owned(
                serde_json::to_vec(v).context("serializing value")?,
            )),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            Value::Bytes(_) => None,
        }
    }

    /// Decodes a payload read from disk according to `mode`. Buffers that
    /// are not handed to the caller go back to `pool`.
    pub(crate) fn decode(
        mode: ReadMode,
        buf: Vec<u8>,
        pool: &mut BufferPool,
    ) -> anyhow::Result<Self> {
        match mode {
            ReadMode::Raw => Ok(Value::Bytes(buf)),
            ReadMode::Json => {
                let parsed = serde_json::from_slice(&buf).context("decoding JSON value");
                pool.give_back(buf);
                Ok(Value::Json(parsed?))
            }
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

/// One entry of a write batch. A missing value deletes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub key: String,
    pub value: Option<Value>,
}

impl Op {
    pub fn put<K, V>(key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Op {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete<K>(key: K) -> Self
    where
        K: Into<String>,
    {
        Op {
            key: key.into(),
            value: None,
        }
    }
}

/// Live bytes versus everything ever written in the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sizes {
    pub live: u64,
    pub total: u64,
}
