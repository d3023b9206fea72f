use k8s_openapi::api::core::v1::Secret;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Hex sha256 over the serialized spec followed by every secret entry in key order.
pub fn compute<T: Serialize>(spec: &T, secret: Option<&Secret>) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(spec).map_err(Error::SerializationError)?);
    if let Some(secret) = secret {
        for (k, v) in secret.data.iter().flatten() {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(&v.0);
            hasher.update([0u8]);
        }
        for (k, v) in secret.string_data.iter().flatten() {
            hasher.update(k.as_bytes());
            hasher.update([0u8]);
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}
