//! Core domain types for STRUBS.
//!
//! Type-safe wrappers for the identifiers and indices that flow through the
//! storage engine. These newtypes prevent mixing up object ids, volume ids,
//! and the two flavors of slice/chunk index at compile time — the same
//! motivation as PAR2's `FileId`/`GlobalSliceIndex` split, just with STRUBS's
//! own shapes.

use md5::{Digest, Md5};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// 12-byte object identifier: 4-byte unix-second timestamp, 3-byte stable
/// host id, 2-byte pid-low, 3-byte monotonic counter. See spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

static COUNTER: AtomicU32 = AtomicU32::new(0);
static HOST_ID: OnceLock<[u8; 3]> = OnceLock::new();

fn host_id() -> [u8; 3] {
    *HOST_ID.get_or_init(|| {
        let hostname = hostname_best_effort();
        let digest = Md5::digest(hostname.as_bytes());
        [digest[13], digest[14], digest[15]]
    })
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

impl ObjectId {
    /// Generate a fresh id. Must be called before any persistence of the
    /// object it names (spec invariant).
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let pid_low = (std::process::id() & 0xFFFF) as u16;
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..7].copy_from_slice(&host_id());
        bytes[7..9].copy_from_slice(&pid_low.to_be_bytes());
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        ObjectId(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// The unix-second timestamp embedded in the id (spec: `getTimestampFromId`).
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(ObjectId(bytes))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 12]> for ObjectId {
    fn from(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }
}

/// Identifier for a Volume, as handed out by the VolumeFleet collaborator.
/// Kept as an opaque string newtype since the fleet owns the id's shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        VolumeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        VolumeId(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        VolumeId(s.to_string())
    }
}

/// A slice's position within a striped object, `0..D+P`. Data slices occupy
/// `[0, D)`, parity slices `[D, D+P)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SliceIndex(u8);

impl SliceIndex {
    pub const fn new(index: u8) -> Self {
        SliceIndex(index)
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn is_parity(&self, data_slice_count: u8) -> bool {
        self.0 >= data_slice_count
    }
}

impl From<u8> for SliceIndex {
    fn from(index: u8) -> Self {
        SliceIndex(index)
    }
}

impl From<usize> for SliceIndex {
    fn from(index: usize) -> Self {
        SliceIndex(index as u8)
    }
}

impl fmt::Display for SliceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a chunk within a single slice (0-based, start chunk first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkIndex(u64);

impl ChunkIndex {
    pub const fn new(index: u64) -> Self {
        ChunkIndex(index)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<u64> for ChunkIndex {
    fn from(index: u64) -> Self {
        ChunkIndex(index)
    }
}

impl std::ops::Add<u64> for ChunkIndex {
    type Output = ChunkIndex;

    fn add(self, rhs: u64) -> ChunkIndex {
        ChunkIndex(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_round_trips_through_hex() {
        let id = ObjectId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 24);
        let parsed = ObjectId::from_hex(&hex).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn object_id_generation_is_monotonic_in_counter() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn object_id_exposes_its_timestamp() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        let id = ObjectId::generate();
        assert!(id.timestamp() >= before);
    }

    #[test]
    fn slice_index_knows_parity_role() {
        let data = SliceIndex::new(3);
        let parity = SliceIndex::new(4);
        assert!(!data.is_parity(4));
        assert!(parity.is_parity(4));
    }
}
