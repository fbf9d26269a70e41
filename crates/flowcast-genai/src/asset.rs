use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use flowcast_core::error::{FlowError, Result};

/// A decoded `data:<mime>;base64,<payload>` URI.
#[derive(Debug, Clone, PartialEq)]
pub struct DataUri {
    pub mime: String,
    pub bytes: Vec<u8>,
}

pub fn is_data_uri(s: &str) -> bool {
    s.starts_with("data:")
}

/// Decode a base64 data URI. Non-base64 data URIs are rejected.
pub fn parse_data_uri(uri: &str) -> Result<DataUri> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| FlowError::Image("not a data URI".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| FlowError::Image("data URI without payload".into()))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| FlowError::Image("data URI is not base64-encoded".into()))?;
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| FlowError::Image(format!("invalid base64 payload: {}", e)))?;
    Ok(DataUri {
        mime: if mime.is_empty() {
            "application/octet-stream".to_string()
        } else {
            mime.to_string()
        },
        bytes,
    })
}

pub fn to_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// Sniff a mime type from magic bytes, defaulting to PNG.
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => "video/mp4",
        _ => "image/png",
    }
}
