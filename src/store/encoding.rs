//! Wire encodings shared by the networked stores.
//!
//! Both encodings carry the two integers as base-10 text:
//! a hash record with fields `"0"` (allowance) and `"1"` (last accessed),
//! or a single packed string `"<allowance>:<last_accessed_ns>"`.

use crate::error::StoreError;
use crate::token_bucket::BucketState;
use std::collections::HashMap;

pub const ALLOWANCE_FIELD: &str = "0";
pub const LAST_ACCESSED_FIELD: &str = "1";
pub const PACKED_DELIMITER: char = ':';

/// Decode a hash record. An empty record is the never-seen sentinel; a
/// record holding only one of the two fields is rejected.
pub fn decode_hash(key: &str, fields: &HashMap<String, String>) -> Result<BucketState, StoreError> {
    if fields.is_empty() {
        return Ok(BucketState::NEVER_SEEN);
    }

    let allowance = required_field(key, fields, ALLOWANCE_FIELD)?;
    let last_accessed_ns = required_field(key, fields, LAST_ACCESSED_FIELD)?;

    Ok(BucketState::new(allowance, last_accessed_ns))
}

fn required_field(
    key: &str,
    fields: &HashMap<String, String>,
    field: &'static str,
) -> Result<i64, StoreError> {
    let raw = fields.get(field).ok_or_else(|| StoreError::KeyFieldMissing {
        key: key.to_string(),
        field,
    })?;
    parse_i64(key, field, raw)
}

/// Decode a packed `"<allowance>:<last_accessed_ns>"` value.
pub fn decode_packed(key: &str, value: &str) -> Result<BucketState, StoreError> {
    let (allowance, last_accessed_ns) = value.split_once(PACKED_DELIMITER).ok_or_else(|| {
        StoreError::corrupt(key, format!("expected '<allowance>:<timestamp>', got '{}'", value))
    })?;

    Ok(BucketState::new(
        parse_i64(key, "allowance", allowance)?,
        parse_i64(key, "last_accessed_ns", last_accessed_ns)?,
    ))
}

pub fn encode_packed(state: BucketState) -> String {
    format!(
        "{}{}{}",
        state.allowance, PACKED_DELIMITER, state.last_accessed_ns
    )
}

fn parse_i64(key: &str, what: &str, raw: &str) -> Result<i64, StoreError> {
    raw.parse::<i64>()
        .map_err(|e| StoreError::corrupt(key, format!("non integer {} '{}': {}", what, raw, e)))
}
