use crate::error::{GatewayError, Result};
use crate::upstream::UpstreamRequest;
use bytes::Bytes;

/// Decode an XML/text response body to a string.
///
/// Defaults to UTF-8; `charset` overrides per request. Latin-1 is decoded
/// byte-wise, so non-ASCII query parameters survive untouched.
pub fn decode_text(bytes: &Bytes, charset: Option<&str>) -> Result<String> {
    let charset = charset.map(|c| c.to_ascii_lowercase());
    match charset.as_deref() {
        None | Some("utf-8") | Some("utf8") => String::from_utf8(bytes.to_vec())
            .map_err(|e| GatewayError::DecodeError(format!("invalid utf-8: {e}"))),
        Some("us-ascii") | Some("ascii") => {
            if bytes.iter().all(u8::is_ascii) {
                Ok(bytes.iter().map(|&b| b as char).collect())
            } else {
                Err(GatewayError::DecodeError(
                    "non-ascii byte in us-ascii body".to_string(),
                ))
            }
        }
        Some("iso-8859-1") | Some("latin-1") | Some("latin1") => {
            Ok(bytes.iter().map(|&b| b as char).collect())
        }
        Some(other) => Err(GatewayError::DecodeError(format!(
            "unsupported charset {other}"
        ))),
    }
}

/// Decode a JSON response body.
pub fn decode_json(bytes: &Bytes) -> Result<serde_json::Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::DecodeError(format!("invalid json: {e}")))
}

/// Encode a structured value as the request payload, with the matching
/// content type. This is the encoder half of the upstream contract.
pub fn json_payload(req: UpstreamRequest, value: &serde_json::Value) -> Result<UpstreamRequest> {
    let body = serde_json::to_vec(value)
        .map_err(|e| GatewayError::DecodeError(format!("encode failed: {e}")))?;
    Ok(req
        .payload(Bytes::from(body))
        .header("content-type", "application/json"))
}
