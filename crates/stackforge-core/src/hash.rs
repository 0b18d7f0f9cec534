//! Deterministic short identifiers for cache keys and logical ids

/// Width of the hex identifiers produced by [`short_hash`]
pub const SHORT_HASH_LEN: usize = 16;

/// Hash `input` with blake3 and keep the first 16 hex characters.
///
/// Stable across process restarts, so a re-run against the same
/// configuration produces the same logical ids.
pub fn short_hash(input: &str) -> String {
    let digest = blake3::hash(input.as_bytes());
    digest.to_hex().as_str()[..SHORT_HASH_LEN].to_string()
}
