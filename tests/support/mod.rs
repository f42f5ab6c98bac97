//! Shared in-memory collaborator fakes for the integration tests (spec §6):
//! an `ObjectMetaStore`, a `RuntimeConfigStore`, and a tempfile-backed
//! `VolumeFleet`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use strubs_core::{
    Config, ConfigStoreError, ContainerEntry, DirectoryMounter, MetaStoreError, ObjectId,
    ObjectMetaStore, RuntimeConfigStore, SliceErrorRecord, StoredObjectRecord, Volume, VolumeError,
    VolumeFleet, VolumeId,
};

#[derive(Default)]
pub struct InMemoryMeta {
    records: Mutex<HashMap<ObjectId, StoredObjectRecord>>,
}

#[async_trait]
impl ObjectMetaStore for InMemoryMeta {
    async fn create_object_record(&self, record: StoredObjectRecord) -> Result<(), MetaStoreError> {
        self.records.lock().unwrap().insert(record.id, record);
        Ok(())
    }

    async fn delete_object_by_id(&self, id: ObjectId) -> Result<(), MetaStoreError> {
        self.records.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn get_object_by_path(&self, _path: &str) -> Result<Option<StoredObjectRecord>, MetaStoreError> {
        Ok(None)
    }

    async fn get_object_by_id(&self, id: ObjectId) -> Result<Option<StoredObjectRecord>, MetaStoreError> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn get_objects_in_container_path(
        &self,
        _path: &str,
    ) -> Result<Vec<ContainerEntry>, MetaStoreError> {
        Ok(Vec::new())
    }

    async fn get_or_create_container(&self, _path: &str) -> Result<Option<String>, MetaStoreError> {
        Ok(None)
    }

    async fn find_objects_needing_verification(
        &self,
        started_at: u64,
        limit: usize,
    ) -> Result<Vec<StoredObjectRecord>, MetaStoreError> {
        let mut out: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.last_verified_at.is_none() || r.last_verified_at.unwrap() < started_at)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        out.truncate(limit);
        Ok(out)
    }

    async fn update_object_verification_state(
        &self,
        id: ObjectId,
        last_verified_at: Option<u64>,
        slice_errors: Option<HashMap<u8, SliceErrorRecord>>,
    ) -> Result<(), MetaStoreError> {
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.last_verified_at = last_verified_at;
            record.slice_errors = slice_errors.unwrap_or_default();
        }
        Ok(())
    }

    async fn set_volume_verify_errors(
        &self,
        _volume_id: &VolumeId,
        _errors: Option<strubs_core::volume::VerifyErrorCounts>,
    ) -> Result<(), MetaStoreError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConfigStore {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl RuntimeConfigStore for InMemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ConfigStoreError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), ConfigStoreError> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ConfigStoreError> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// A fleet of tempdir-backed volumes, one per device group by default.
pub struct TestFleet {
    volumes: Vec<Arc<Volume>>,
    _dirs: Vec<tempfile::TempDir>,
}

impl TestFleet {
    pub async fn new(count: usize) -> Self {
        let mut volumes = Vec::with_capacity(count);
        let mut dirs = Vec::with_capacity(count);
        for i in 0..count {
            let dir = tempfile::tempdir().unwrap();
            let volume = Arc::new(Volume::new(
                VolumeId::new(format!("vol-{i}")),
                uuid::Uuid::nil(),
                i as u8,
                dir.path().to_path_buf(),
                format!("group{}", i % 3),
                100_000_000,
            ));
            volume.start(&DirectoryMounter, [0u8; 16]).await.unwrap();
            volumes.push(volume);
            dirs.push(dir);
        }
        TestFleet { volumes, _dirs: dirs }
    }

    pub fn volumes(&self) -> &[Arc<Volume>] {
        &self.volumes
    }
}

#[async_trait]
impl VolumeFleet for TestFleet {
    async fn get_volume(&self, id: &VolumeId) -> Option<Arc<Volume>> {
        self.volumes.iter().find(|v| &v.id == id).cloned()
    }

    async fn get_volume_entries(&self) -> Vec<(VolumeId, Arc<Volume>)> {
        self.volumes.iter().map(|v| (v.id.clone(), v.clone())).collect()
    }

    async fn get_writable_volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.iter().filter(|v| v.is_writable()).cloned().collect()
    }
}

pub fn test_config(d: u8, p: u8, chunk_size: u32) -> Config {
    Config {
        data_slice_count: d,
        parity_slice_count: p,
        chunk_size,
        ..Config::default()
    }
}

#[allow(dead_code)]
pub fn volume_error_is_not_readable(err: &VolumeError) -> bool {
    matches!(err, VolumeError::NotReadable(_))
}
