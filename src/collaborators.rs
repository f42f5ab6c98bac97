//! Async traits for the systems the core depends on but does not own:
//! the metadata store, the runtime key/value config store, and the fleet
//! of mounted volumes (spec §6). Callers wire up real implementations;
//! `tests/support` carries in-memory ones for the integration tests.

use crate::domain::{ObjectId, VolumeId};
use crate::volume::{Volume, VolumeError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-slice error recorded by a verify pass or a failed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceErrorRecord {
    pub checksum: bool,
    pub slice_kind: SliceKind,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceKind {
    Data,
    Parity,
}

/// What the `ObjectMetaStore` holds; the core reads/writes only these fields
/// (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObjectRecord {
    pub id: ObjectId,
    pub container_id: Option<String>,
    pub name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub data_volumes: Vec<VolumeId>,
    pub parity_volumes: Vec<VolumeId>,
    pub md5: [u8; 16],
    pub mime: Option<String>,
    pub unavailable_slices: Vec<u8>,
    pub damaged_slices: Vec<u8>,
    pub last_verified_at: Option<u64>,
    pub slice_errors: HashMap<u8, SliceErrorRecord>,
}

/// A directory entry as returned by `getObjectsInContainerPath`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub id: ObjectId,
    pub name: String,
    pub is_file: bool,
    pub is_container: bool,
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("object {0} not found")]
    NotFound(ObjectId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("metadata store error: {0}")]
    Other(String),
}

/// Document-store-backed object/container/volume-error bookkeeping.
#[async_trait]
pub trait ObjectMetaStore: Send + Sync {
    async fn create_object_record(&self, record: StoredObjectRecord) -> Result<(), MetaStoreError>;
    async fn delete_object_by_id(&self, id: ObjectId) -> Result<(), MetaStoreError>;
    async fn get_object_by_path(&self, path: &str) -> Result<Option<StoredObjectRecord>, MetaStoreError>;
    async fn get_object_by_id(&self, id: ObjectId) -> Result<Option<StoredObjectRecord>, MetaStoreError>;
    async fn get_objects_in_container_path(
        &self,
        path: &str,
    ) -> Result<Vec<ContainerEntry>, MetaStoreError>;
    async fn get_or_create_container(&self, path: &str) -> Result<Option<String>, MetaStoreError>;
    async fn find_objects_needing_verification(
        &self,
        started_at: u64,
        limit: usize,
    ) -> Result<Vec<StoredObjectRecord>, MetaStoreError>;
    async fn update_object_verification_state(
        &self,
        id: ObjectId,
        last_verified_at: Option<u64>,
        slice_errors: Option<HashMap<u8, SliceErrorRecord>>,
    ) -> Result<(), MetaStoreError>;
    async fn set_volume_verify_errors(
        &self,
        volume_id: &VolumeId,
        errors: Option<crate::volume::VerifyErrorCounts>,
    ) -> Result<(), MetaStoreError>;

    /// Extracts the unix-second prefix embedded in an id — pure, but kept as
    /// a store method per spec §6 since the metadata store is the only
    /// collaborator that otherwise touches raw ids in this way.
    fn get_timestamp_from_id(&self, id: ObjectId) -> u32 {
        id.timestamp()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("runtime config store error: {0}")]
    Other(String),
}

/// Small key/value store used for the verifier's resume cursor and last-run
/// summary (spec §6). Values are opaque strings — the core only ever stores
/// JSON-serializable scalars here, so no particular format is mandated.
#[async_trait]
pub trait RuntimeConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigStoreError>;
    async fn set(&self, key: &str, value: String) -> Result<(), ConfigStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ConfigStoreError>;
}

/// The set of started, possibly-writable volumes the core operates over.
#[async_trait]
pub trait VolumeFleet: Send + Sync {
    async fn get_volume(&self, id: &VolumeId) -> Option<Arc<Volume>>;
    async fn get_volume_entries(&self) -> Vec<(VolumeId, Arc<Volume>)>;
    async fn get_writable_volumes(&self) -> Vec<Arc<Volume>>;
}

/// Narrow error surface for fleet bring-up: volume-start failures are
/// per-volume (spec §7), so a fleet impl's `start_all` counts the two
/// outcomes rather than failing outright.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FleetStartReport {
    pub started: usize,
    pub failed: usize,
}

impl FleetStartReport {
    pub fn record(&mut self, result: &Result<(), VolumeError>) {
        match result {
            Ok(()) => self.started += 1,
            Err(_) => self.failed += 1,
        }
    }
}
