//! Payload compression for update frames.
//!
//! Compressed payloads are zlib-deflated JSON, base64-encoded so they still
//! travel in a text frame's `data` field. The frame's `compressed` flag tells
//! the receiver to run [`decompress_value`].

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde_json::Value;

use crate::error::GatewayError;

/// Deflates and base64-encodes a serialized JSON value.
///
/// # Errors
///
/// Returns [`GatewayError::Serialization`] if the value cannot be
/// serialized, or [`GatewayError::Internal`] if the encoder fails.
pub fn compress_value(value: &Value) -> Result<String, GatewayError> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::fast());
    encoder
        .write_all(&json)
        .map_err(|e| GatewayError::Internal(format!("zlib write failed: {e}")))?;
    let deflated = encoder
        .finish()
        .map_err(|e| GatewayError::Internal(format!("zlib finish failed: {e}")))?;
    Ok(STANDARD.encode(deflated))
}

/// Reverses [`compress_value`].
///
/// # Errors
///
/// Returns [`GatewayError::InvalidMessage`] if the input is not valid
/// base64 or zlib, or [`GatewayError::Serialization`] if the inflated bytes
/// are not JSON.
pub fn decompress_value(encoded: &str) -> Result<Value, GatewayError> {
    let deflated = STANDARD
        .decode(encoded)
        .map_err(|e| GatewayError::InvalidMessage(format!("bad base64 payload: {e}")))?;
    let mut json = Vec::new();
    ZlibDecoder::new(deflated.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| GatewayError::InvalidMessage(format!("bad zlib payload: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}
