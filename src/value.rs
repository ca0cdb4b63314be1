//! Stored value model.
//!
//! A record's value is held in one of four forms, see [`ValueHolder`]. The
//! sentinel states are plain enum variants and are matched structurally.

use crate::types::EntryError;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// User-visible value stored under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
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

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// Sentinel value states a record can be in besides holding a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    Invalid,
    LocalInvalid,
    Tombstone,
}

impl Token {
    /// Both invalid states read as "no value".
    pub fn is_invalid(&self) -> bool {
        matches!(self, Token::Invalid | Token::LocalInvalid)
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            Token::Invalid => 0,
            Token::LocalInvalid => 1,
            Token::Tombstone => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self, EntryError> {
        match code {
            0 => Ok(Token::Invalid),
            1 => Ok(Token::LocalInvalid),
            2 => Ok(Token::Tombstone),
            other => Err(EntryError::Malformed(format!("unknown token code {other}"))),
        }
    }
}

// What the serialized bytes inside a CachedDeserializable decode to.
#[derive(Serialize, Deserialize)]
enum Encoded {
    Value(Value),
    Token(Token),
}

/// Outcome of resolving a [`CachedDeserializable`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Arc<Value>),
    Token(Token),
}

impl Resolved {
    /// Sentinels resolve to `None`.
    pub fn into_value(self) -> Option<Arc<Value>> {
        match self {
            Resolved::Value(v) => Some(v),
            Resolved::Token(_) => None,
        }
    }
}

/// A value kept in encoded form and materialized on demand.
///
/// The first [`deserialized_value`](Self::deserialized_value) call caches the
/// resolved instance and later calls share it. Clones share that cache,
/// whether they were made before or after the first resolution.
#[derive(Clone)]
pub struct CachedDeserializable {
    bytes: Arc<[u8]>,
    shared: Arc<OnceCell<Resolved>>,
}

impl CachedDeserializable {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
            shared: Arc::new(OnceCell::new()),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, EntryError> {
        Self::encode(&Encoded::Value(value.clone()))
    }

    pub fn from_token(token: Token) -> Result<Self, EntryError> {
        Self::encode(&Encoded::Token(token))
    }

    fn encode(encoded: &Encoded) -> Result<Self, EntryError> {
        let bytes =
            bincode::serialize(encoded).map_err(|e| EntryError::Deserialization(e.to_string()))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn serialized_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Shared resolved instance, decoded at most once.
    pub fn deserialized_value(&self) -> Result<Resolved, EntryError> {
        self.shared.get_or_try_init(|| self.decode()).cloned()
    }

    /// A freshly decoded instance that no other caller holds.
    pub fn deserialized_writable_copy(&self) -> Result<Resolved, EntryError> {
        self.decode()
    }

    fn decode(&self) -> Result<Resolved, EntryError> {
        let encoded: Encoded = bincode::deserialize(&self.bytes)
            .map_err(|e| EntryError::Deserialization(e.to_string()))?;
        Ok(match encoded {
            Encoded::Value(v) => Resolved::Value(Arc::new(v)),
            Encoded::Token(t) => Resolved::Token(t),
        })
    }
}

impl PartialEq for CachedDeserializable {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl fmt::Debug for CachedDeserializable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedDeserializable")
            .field("len", &self.bytes.len())
            .field("resolved", &self.shared.get().is_some())
            .finish()
    }
}

/// The value slot of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueHolder {
    Absent,
    Object(Arc<Value>),
    Serialized(CachedDeserializable),
    Token(Token),
}

impl ValueHolder {
    pub fn object(value: impl Into<Value>) -> Self {
        ValueHolder::Object(Arc::new(value.into()))
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, ValueHolder::Token(Token::Tombstone))
    }

    /// Resolves to a shared value, treating every sentinel as absent.
    pub fn resolve(&self) -> Result<Option<Arc<Value>>, EntryError> {
        match self {
            ValueHolder::Absent | ValueHolder::Token(_) => Ok(None),
            ValueHolder::Object(v) => Ok(Some(Arc::clone(v))),
            ValueHolder::Serialized(cd) => Ok(cd.deserialized_value()?.into_value()),
        }
    }
}

impl fmt::Display for ValueHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueHolder::Absent => write!(f, "null"),
            ValueHolder::Object(v) => write!(f, "{v:?}"),
            ValueHolder::Serialized(cd) => {
                write!(f, "CachedDeserializable({} bytes)", cd.serialized_bytes().len())
            }
            ValueHolder::Token(t) => write!(f, "{t:?}"),
        }
    }
}
