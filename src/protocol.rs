//! Resumable upload wire protocol shared by the client and the server.
//!
//! ```text
//! Create:   POST  <endpoint>   Upload-Length, Upload-Metadata   -> 201 Location
//! Probe:    HEAD  <location>                                    -> Upload-Offset
//! Transfer: PATCH <location>   Upload-Offset + bytes            -> 204 Upload-Offset
//! Complete: POST  <webhook>    {session_id, metadata}           -> {artifact_id, status}
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};

pub const HEADER_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const HEADER_UPLOAD_EXPIRES: &str = "Upload-Expires";
pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const CHUNK_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Metadata key carrying the client record id
pub const META_RECORD_ID: &str = "record_id";

/// Size of the throughput probe body
pub const PROBE_BYTES: usize = 1024;

/// Encode metadata as `key base64(value)` pairs separated by commas
pub fn encode_metadata(metadata: &BTreeMap<String, String>) -> String {
    metadata
        .iter()
        .map(|(key, value)| format!("{} {}", key, STANDARD.encode(value.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode an `Upload-Metadata` header value
pub fn decode_metadata(header: &str) -> Result<BTreeMap<String, String>, String> {
    let mut metadata = BTreeMap::new();

    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("invalid metadata key in '{}'", pair));
        }

        let value = match parts.next() {
            Some(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| format!("invalid base64 for '{}': {}", key, e))?;
                String::from_utf8(bytes).map_err(|_| format!("metadata '{}' is not UTF-8", key))?
            }
            None => String::new(),
        };

        metadata.insert(key.to_string(), value);
    }

    Ok(metadata)
}

/// Bytes covered by the payload hash of a create request
pub fn create_signing_bytes(upload_length: u64, metadata_header: &str) -> Vec<u8> {
    format!("{}\n{}", upload_length, metadata_header).into_bytes()
}

/// Format an epoch-ms expiry as an `Upload-Expires` value
pub fn format_expires(epoch_ms: i64) -> String {
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .map(|dt| dt.to_rfc2822())
        .unwrap_or_default()
}

/// Parse an `Upload-Expires` value into epoch ms
pub fn parse_expires(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Session id from a session location (its last path segment)
pub fn session_id_from_location(location: &str) -> &str {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location)
}
