//! Payload compression.
//!
//! Bodies are zstd frames tagged with `content-encoding=zstd`. A body with no
//! encoding is taken as raw bytes.

/// `content-encoding` value for zstd bodies.
pub const ZSTD_ENCODING: &str = "zstd";

/// zstd compression level used for outbound payloads.
pub const COMPRESSION_LEVEL: i32 = 3;

/// Compress a payload.
///
/// # Errors
///
/// Returns error if the encoder fails.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::encode_all(data, COMPRESSION_LEVEL).map_err(|e| CodecError::Compress(e.to_string()))
}

/// Decompress a zstd payload.
///
/// # Errors
///
/// Returns error if `data` is not a valid zstd frame.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::stream::decode_all(data).map_err(|e| CodecError::Decompress(e.to_string()))
}

/// Decode a body according to its declared `content-encoding`.
///
/// # Errors
///
/// Returns error for an unknown encoding or a corrupt frame.
pub fn decode_body(encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    match encoding {
        None => Ok(body.to_vec()),
        Some(ZSTD_ENCODING) => decompress(body),
        Some(other) => Err(CodecError::UnsupportedEncoding(other.to_string())),
    }
}

/// Errors from the payload codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Compression failed
    #[error("compression failed: {0}")]
    Compress(String),
    /// Decompression failed
    #[error("decompression failed: {0}")]
    Decompress(String),
    /// Body declared an encoding this instance cannot decode
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_then_decode() {
        let xml = b"<root><child>text</child></root>".repeat(20);
        let compressed = compress(&xml).unwrap();
        assert!(compressed.len() < xml.len());
        assert_eq!(decode_body(Some(ZSTD_ENCODING), &compressed).unwrap(), xml);
    }

    #[test]
    fn absent_encoding_is_raw() {
        assert_eq!(decode_body(None, b"raw").unwrap(), b"raw");
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        assert_eq!(
            decode_body(Some("gzip"), b"x"),
            Err(CodecError::UnsupportedEncoding("gzip".to_string()))
        );
    }

    #[test]
    fn corrupt_frame_is_rejected() {
        assert!(matches!(
            decompress(b"not a zstd frame"),
            Err(CodecError::Decompress(_))
        ));
    }
}
