use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Compute SHA-256 of an in-memory byte slice.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Encode a raw 32-byte hash as a lowercase hex string (64 chars).
pub fn to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// Dedup key for a raw payload.
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&sha256_bytes(data))
}

/// Content-addressed location: `<base>/<first 2 hex chars>/<hex>.<ext>`.
pub fn content_path(base: &Path, hash_hex: &str, ext: &str) -> PathBuf {
    let shard = hash_hex.get(..2).unwrap_or("00");
    base.join(shard).join(format!("{hash_hex}.{ext}"))
}
