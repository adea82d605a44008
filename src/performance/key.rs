use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::error_handling::OptimizationError;

const DIGEST_HEX_LEN: usize = 32;

/// Derives `"{service}:{operation}:{digest}"` where the digest covers a
/// canonical rendering of `params` with object keys sorted at every depth.
///
/// The readable prefix keeps pattern invalidation by service or operation
/// possible.
pub fn derive_cache_key<P>(
    service: &str,
    operation: &str,
    params: &P,
) -> Result<String, OptimizationError>
where
    P: Serialize + ?Sized,
{
    let value = serde_json::to_value(params).map_err(|e| OptimizationError::codec("json", e))?;

    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update([0u8]);
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Ok(format!(
        "{}:{}:{}",
        service,
        operation,
        &digest[..DIGEST_HEX_LEN]
    ))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, nested)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(nested, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}
