use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::error_handling::OptimizationError;

/// Turns cache values into bytes and back. The cache tiers only ever see
/// the encoded form.
pub trait CacheCodec: fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, OptimizationError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, OptimizationError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, OptimizationError> {
        serde_json::to_vec(value).map_err(|e| OptimizationError::codec(self.name(), e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, OptimizationError> {
        serde_json::from_slice(bytes).map_err(|e| OptimizationError::codec(self.name(), e))
    }
}

/// Compact binary codec. Values must not rely on `deserialize_any`
/// (e.g. `serde_json::Value` or internally tagged enums).
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl CacheCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, OptimizationError> {
        bincode::serialize(value).map_err(|e| OptimizationError::codec(self.name(), e))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, OptimizationError> {
        bincode::deserialize(bytes).map_err(|e| OptimizationError::codec(self.name(), e))
    }
}

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;
const HEADER_LEN: usize = 9;

/// Largest decompressed value accepted from the distributed tier.
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;

/// Framing for values written to the distributed tier:
/// `[flag: u8][expires_at_ms: u64 BE][payload]`, where the payload is LZ4
/// compressed when `flag == 1`.
///
/// Carrying the absolute expiry lets a promoted copy keep the remaining TTL
/// instead of restarting it.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    compress: bool,
    threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedValue {
    pub value: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(compress: bool, threshold: usize) -> Self {
        Self { compress, threshold }
    }

    pub fn seal(&self, value: &[u8], expires_at: DateTime<Utc>) -> Vec<u8> {
        let (flag, payload) = if self.compress && value.len() >= self.threshold {
            (FLAG_LZ4, lz4_flex::compress_prepend_size(value))
        } else {
            (FLAG_RAW, value.to_vec())
        };

        let expires_ms = expires_at.timestamp_millis().max(0) as u64;

        let mut sealed = Vec::with_capacity(HEADER_LEN + payload.len());
        sealed.push(flag);
        sealed.extend_from_slice(&expires_ms.to_be_bytes());
        sealed.extend_from_slice(&payload);
        sealed
    }

    pub fn open(&self, sealed: &[u8]) -> Result<OpenedValue, OptimizationError> {
        if sealed.len() < HEADER_LEN {
            return Err(OptimizationError::codec(
                "envelope",
                format!("frame too short: {} bytes", sealed.len()),
            ));
        }

        let mut expires_bytes = [0u8; 8];
        expires_bytes.copy_from_slice(&sealed[1..HEADER_LEN]);
        let expires_ms = i64::try_from(u64::from_be_bytes(expires_bytes))
            .map_err(|e| OptimizationError::codec("envelope", e))?;
        let expires_at = Utc
            .timestamp_millis_opt(expires_ms)
            .single()
            .ok_or_else(|| OptimizationError::codec("envelope", "expiry out of range"))?;

        let payload = &sealed[HEADER_LEN..];
        let value = match sealed[0] {
            FLAG_RAW => payload.to_vec(),
            FLAG_LZ4 => {
                let declared = payload
                    .get(..4)
                    .map(|prefix| u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]))
                    .ok_or_else(|| OptimizationError::codec("lz4", "missing size prefix"))?;
                if declared as usize > MAX_DECOMPRESSED_LEN {
                    return Err(OptimizationError::codec(
                        "lz4",
                        format!(
                            "declared size {} exceeds limit of {} bytes",
                            declared, MAX_DECOMPRESSED_LEN
                        ),
                    ));
                }
                lz4_flex::decompress_size_prepended(payload)
                    .map_err(|e| OptimizationError::codec("lz4", e))?
            }
            other => {
                return Err(OptimizationError::codec(
                    "envelope",
                    format!("unknown frame flag {}", other),
                ))
            }
        };

        Ok(OpenedValue { value, expires_at })
    }
}
