//! Compact payload encoding for signal documents: JSON, gzip, base64.

use std::io::{Read, Write};

use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Decompressed payloads larger than this are rejected (zip-bomb guard)
pub const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

pub fn encode_payload<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .map_err(|e| Error::codec(format!("gzip write failed: {e}")))?;
    let compressed = gz
        .finish()
        .map_err(|e| Error::codec(format!("gzip finish failed: {e}")))?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode_payload<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let compressed = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::codec(format!("invalid base64: {e}")))?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    // read one byte past the limit so oversize input is detectable
    let mut limited = gz.take(MAX_DECOMPRESSED_SIZE + 1);
    limited
        .read_to_end(&mut json)
        .map_err(|e| Error::codec(format!("gunzip failed: {e}")))?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(Error::codec("payload exceeds decompression limit"));
    }

    Ok(serde_json::from_slice(&json)?)
}
