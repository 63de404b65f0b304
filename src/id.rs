//! Identifier utilities for wavecrowd
//!
//! Pair names are derived from the two document ids; the pair hash is the
//! only identifier that ever reaches the marketplace.

use sha2::{Digest, Sha256};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build the stable pair name for two documents
///
/// Format: `pair_{doc_a}_and_{doc_b}`, in the order the documents appear in
/// their group.
pub fn pair_name(doc_a: &str, doc_b: &str) -> String {
    format!("pair_{}_and_{}", doc_a, doc_b)
}

/// Opaque content hash of a pair name (lower-case hex SHA-256)
pub fn pair_hash(pair_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pair_name.as_bytes());
    hex::encode(hasher.finalize())
}
