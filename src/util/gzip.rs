use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Prefix of a base64-encoded gzip stream (`1f 8b 08` + flag byte).
pub const GZIP_BASE64_PREFIX: &str = "H4sI";

/// Compress a payload and base64-encode it. Falls back to the input on
/// encoder failure so the signaling path can always send something.
pub fn compress(data: &str) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(data.as_bytes()).is_err() {
        return data.to_string();
    }
    match encoder.finish() {
        Ok(bytes) => BASE64.encode(bytes),
        Err(_) => data.to_string(),
    }
}

/// Decode a base64-encoded gzip payload back into a string.
pub fn decompress(data: &str) -> Result<String, std::io::Error> {
    let decoded = BASE64
        .decode(data)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let mut decoder = GzDecoder::new(decoded.as_slice());
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_payload() {
        let payload = r#"{"type":"answer","sdp":"v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n"}"#;
        let packed = compress(payload);
        assert!(packed.starts_with(GZIP_BASE64_PREFIX));
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn decompress_rejects_plain_text() {
        assert!(decompress("not base64!!").is_err());
        // Valid base64 but not a gzip stream.
        assert!(decompress("aGVsbG8=").is_err());
    }
}
