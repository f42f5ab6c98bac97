//! Centralized MD5 hashing utilities.
//!
//! Every checksum STRUBS computes — chunk payload MD5s, the file header MD5,
//! and the whole-object MD5 accumulated by the Writer — goes through here, so
//! there's one place that picks the hasher and its feature flags.

use md5::{Digest, Md5};

/// Compute the MD5 of a single buffer in one shot.
#[inline]
pub fn compute_md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// Start an incremental MD5 hasher (used by the Writer to hash plaintext as
/// it streams through, and by chunk framing to hash one payload at a time).
#[inline]
pub fn new_md5_hasher() -> Md5 {
    Md5::new()
}

#[inline]
pub fn finalize_md5(hasher: Md5) -> [u8; 16] {
    hasher.finalize().into()
}
