//! Text encodings understood by the engine
//!
//! `Encoding::encode` turns a string written in some encoding (for example a
//! base64 text) into raw bytes; `TextDecoder` turns a byte stream back into
//! text, keeping incomplete multi-byte sequences until the next chunk.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::{alphabet, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Accepts base64 input with or without trailing padding
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Encoding {
    Utf8,
    Base64,
    Hex,
    Latin1,
}

impl Encoding {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Base64 => "base64",
            Self::Hex => "hex",
            Self::Latin1 => "latin1",
        }
    }

    /// Convert text expressed in this encoding to raw bytes
    ///
    /// # Errors
    /// Returns `StreamError::Encoding` if the text is not valid base64/hex.
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Base64 => {
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                LENIENT_BASE64
                    .decode(compact)
                    .map_err(|e| StreamError::Encoding(format!("base64: {e}")))
            }
            Self::Hex => hex::decode(text).map_err(|e| StreamError::Encoding(format!("hex: {e}"))),
            #[allow(clippy::cast_possible_truncation)]
            Self::Latin1 => Ok(text.chars().map(|c| (u32::from(c) & 0xFF) as u8).collect()),
        }
    }

    /// Stateless conversion of complete bytes to text in this encoding
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> String {
        let mut decoder = TextDecoder::new(self);
        let mut text = decoder.write(bytes);
        text.push_str(&decoder.end());
        text
    }
}

impl Default for Encoding {
    fn default() -> Self {
        Self::Utf8
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "base64" => Ok(Self::Base64),
            "hex" => Ok(Self::Hex),
            "latin1" | "binary" => Ok(Self::Latin1),
            other => Err(StreamError::Encoding(format!("unknown encoding: {other}"))),
        }
    }
}

impl TryFrom<String> for Encoding {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Encoding> for String {
    fn from(value: Encoding) -> Self {
        value.name().to_string()
    }
}

/// Incremental bytes-to-text decoder
///
/// Bytes that cannot be decoded yet (a UTF-8 sequence split across chunks,
/// or a base64 group shorter than three bytes) are carried into the next
/// `write`. `end` flushes whatever is left.
#[derive(Debug, Clone)]
pub struct TextDecoder {
    encoding: Encoding,
    pending: Vec<u8>,
}

impl TextDecoder {
    #[must_use]
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn write(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 => self.write_utf8(bytes),
            Encoding::Base64 => {
                let mut data = std::mem::take(&mut self.pending);
                data.extend_from_slice(bytes);
                let complete = data.len() - data.len() % 3;
                self.pending = data.split_off(complete);
                STANDARD.encode(data)
            }
            Encoding::Hex => hex::encode(bytes),
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }

    pub fn end(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            return String::new();
        }
        match self.encoding {
            Encoding::Utf8 => String::from_utf8_lossy(&rest).into_owned(),
            Encoding::Base64 => STANDARD.encode(rest),
            Encoding::Hex | Encoding::Latin1 => String::new(),
        }
    }

    fn write_utf8(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);

        let mut out = String::with_capacity(data.len());
        let mut rest = data.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = after.get(bad..).unwrap_or_default();
                        }
                    }
                }
            }
        }
        out
    }
}
