//! The unit of data moved through the engine

use std::fmt;

use serde_json::Value;

use crate::encoding::Encoding;
use crate::error::{Result, StreamError};

/// One unit of data: raw bytes, text, or an opaque object
///
/// Byte-mode streams carry `Bytes` (or `Text` once a readable encoding is
/// declared); object-mode streams carry anything, each chunk counting as one
/// unit against the high-water mark.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Bytes(Vec<u8>),
    Text(String),
    Object(Value),
}

impl Chunk {
    /// Byte length of the payload; objects count as 1
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Text(s) => s.len(),
            Self::Object(_) => 1,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size accounted against the high-water mark
    #[must_use]
    pub fn weight(&self, object_mode: bool) -> usize {
        if object_mode {
            1
        } else {
            self.len()
        }
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            Self::Object(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Bytes(_) | Self::Object(_) => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&Value> {
        match self {
            Self::Object(v) => Some(v),
            Self::Bytes(_) | Self::Text(_) => None,
        }
    }

    /// Render the chunk as text: bytes are decoded as lossy UTF-8, JSON
    /// strings are unquoted, other objects are serialized.
    #[must_use]
    pub fn to_text_lossy(&self) -> String {
        match self {
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Text(s) => s.clone(),
            Self::Object(Value::String(s)) => s.clone(),
            Self::Object(v) => v.to_string(),
        }
    }

    /// Convert to raw bytes, interpreting text in `encoding`
    ///
    /// # Errors
    /// Objects have no byte representation; malformed encoded text fails too.
    pub fn into_bytes(self, encoding: Encoding) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(b) => Ok(b),
            Self::Text(s) => encoding.encode(&s),
            Self::Object(_) => Err(StreamError::InvalidChunk(
                "objects are only accepted in object mode".to_string(),
            )),
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text_lossy())
    }
}

impl From<&str> for Chunk {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Chunk {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Chunk {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Chunk {
    fn from(value: &[u8; N]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<Value> for Chunk {
    fn from(value: Value) -> Self {
        Self::Object(value)
    }
}
