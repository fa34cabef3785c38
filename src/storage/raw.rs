//! Raw payload compression

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

use crate::utils::error::StoreError;

/// Serialize a payload to JSON and gzip it
pub fn compress_json(payload: &serde_json::Value) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(payload).map_err(|e| StoreError::Encode(e.to_string()))?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    encoder.finish().map_err(|e| StoreError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;

    fn decompress_json(bytes: &[u8]) -> Result<serde_json::Value, StoreError> {
        let mut json = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut json)
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Encode(e.to_string()))
    }

    #[test]
    fn test_compressed_payload_is_gzip() {
        let payload = json!({ "period": "2024-06-07T17:00:00Z", "entries": [] });
        let bytes = compress_json(&payload).unwrap();

        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert_eq!(decompress_json(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decompress_json(b"plain text"),
            Err(StoreError::Encode(_))
        ));
    }
}
