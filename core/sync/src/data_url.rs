//! `data:` URI encoding for payloads kept inline in the upload queue.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use fieldsync_common::{Error, Result};

/// Encode `bytes` as `data:{mime};base64,...`.
pub fn encode(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(bytes))
}

/// Split a base64 `data:` URI into its MIME type and bytes.
pub fn decode(data_url: &str) -> Result<(String, Vec<u8>)> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| Error::InvalidInput("not a data URL".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::InvalidInput("data URL has no payload".to_string()))?;
    let mime_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| Error::InvalidInput("data URL is not base64 encoded".to_string()))?;

    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| Error::Serialization(format!("invalid base64 payload: {}", e)))?;
    Ok((mime_type.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_shape() {
        assert_eq!(encode("image/png", b"abc"), "data:image/png;base64,YWJj");
    }

    #[test]
    fn test_decode() {
        let (mime, bytes) = decode("data:image/jpeg;base64,/9j/").unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(bytes, vec![0xff, 0xd8, 0xff]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(decode("image/png;base64,YWJj").is_err());
        assert!(decode("data:image/png;base64").is_err());
        assert!(decode("data:text/plain,hello").is_err());
        assert!(matches!(
            decode("data:image/png;base64,@@@"),
            Err(Error::Serialization(_))
        ));
    }
}
