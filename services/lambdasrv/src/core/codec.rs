//! Register codec for multi-word Modbus values.
//!
//! Pure functions; byte order is resolved once per connection bind from the
//! configuration document, never per read.

use crate::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};

/// Word order for 32-bit values spanning two holding registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// High word first: `(hi << 16) | lo`
    #[default]
    Big,
    /// Low word first: `(lo << 16) | hi`
    Little,
}

impl ByteOrder {
    /// Parse the configured byte order, falling back to big-endian on
    /// anything unrecognized.
    pub fn from_config(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "big" => ByteOrder::Big,
            "little" => ByteOrder::Little,
            other => {
                tracing::warn!(
                    value = other,
                    "Unknown int32_byte_order, falling back to big"
                );
                ByteOrder::Big
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ByteOrder::Big => "big",
            ByteOrder::Little => "little",
        }
    }
}

/// Combine two 16-bit registers into an unsigned 32-bit value.
///
/// Extra words beyond the first two are ignored; fewer than two is an error.
pub fn combine_int32(words: &[u16], order: ByteOrder) -> BridgeResult<u32> {
    if words.len() < 2 {
        return Err(BridgeError::input_invalid(format!(
            "int32 needs two registers, got {}",
            words.len()
        )));
    }
    let value = match order {
        ByteOrder::Big => (u32::from(words[0]) << 16) | u32::from(words[1]),
        ByteOrder::Little => (u32::from(words[1]) << 16) | u32::from(words[0]),
    };
    Ok(value)
}

/// Reinterpret an unsigned 32-bit value as two's-complement signed.
pub fn to_signed_32(value: u32) -> i32 {
    value as i32
}
