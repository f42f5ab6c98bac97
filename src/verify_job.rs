//! Single-flight background verification scan (spec §4.7).

use crate::collaborators::{ObjectMetaStore, RuntimeConfigStore, SliceErrorRecord, SliceKind, VolumeFleet};
use crate::domain::{ObjectId, VolumeId};
use crate::plan::Plan;
use crate::priority::{Priority, VolumePriority};
use crate::shutdown::IoShutdown;
use crate::slice_verifier::{SliceVerifier, VerifyOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyStatus {
    pub running: bool,
    pub started_at: Option<u64>,
    pub objects_verified: u64,
    pub total_errors: u64,
    pub checksum_errors: u64,
    pub volume_errors: HashMap<VolumeId, u64>,
}

struct RunHandle {
    handle: JoinHandle<()>,
    started_at: u64,
    shutdown: IoShutdown,
}

/// Periodically re-reads every object's slices, attributes corruption to
/// objects and volumes, and persists a resumable cursor in the
/// `RuntimeConfigStore`. Exactly one scan runs at a time.
pub struct VerifyJob<M, C, F> {
    meta: Arc<M>,
    config_store: Arc<C>,
    fleet: Arc<F>,
    priority: Arc<VolumePriority>,
    batch_size: usize,
    status: Arc<Mutex<VerifyStatus>>,
    run: Mutex<Option<RunHandle>>,
}

const VERIFY_STARTED_AT_KEY: &str = "verifyStartedAt";
const LAST_VERIFY_KEY: &str = "lastVerify";

impl<M, C, F> VerifyJob<M, C, F>
where
    M: ObjectMetaStore + 'static,
    C: RuntimeConfigStore + 'static,
    F: VolumeFleet + 'static,
{
    pub fn new(meta: Arc<M>, config_store: Arc<C>, fleet: Arc<F>, priority: Arc<VolumePriority>, batch_size: usize) -> Self {
        VerifyJob {
            meta,
            config_store,
            fleet,
            priority,
            batch_size: batch_size.max(1),
            status: Arc::new(Mutex::new(VerifyStatus::default())),
            run: Mutex::new(None),
        }
    }

    /// Returns the scan's `startedAt`. If one is already running, returns
    /// its `startedAt` without starting a second one.
    pub async fn start(self: &Arc<Self>) -> u64 {
        let mut run = self.run.lock().await;
        if let Some(existing) = run.as_ref() {
            return existing.started_at;
        }

        let started_at = match self.config_store.get(VERIFY_STARTED_AT_KEY).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| now_unix()),
            _ => {
                let fresh = now_unix();
                self.config_store.set(VERIFY_STARTED_AT_KEY, fresh.to_string()).await.ok();
                fresh
            }
        };

        for (volume_id, volume) in self.fleet.get_volume_entries().await {
            volume.set_verify_errors(None);
            self.meta.set_volume_verify_errors(&volume_id, None).await.ok();
        }

        *self.status.lock().await = VerifyStatus {
            running: true,
            started_at: Some(started_at),
            ..Default::default()
        };

        let shutdown = IoShutdown::new();
        let job = self.clone();
        let loop_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            job.run_loop(started_at, loop_shutdown).await;
        });

        *run = Some(RunHandle { handle, started_at, shutdown });
        started_at
    }

    /// Sets the abort flag; the current slice finishes, further slices in
    /// the object (and subsequent objects) fail with `IOABORT`, and the
    /// cursor is left in place for the next `start()` to resume from.
    pub async fn stop(&self) {
        if let Some(run) = self.run.lock().await.as_ref() {
            run.shutdown.abort("verify job stop requested");
        }
    }

    pub async fn status(&self) -> VerifyStatus {
        self.status.lock().await.clone()
    }

    async fn run_loop(self: Arc<Self>, started_at: u64, shutdown: IoShutdown) {
        loop {
            if shutdown.throw_if_aborted().is_err() {
                self.finish_run(false).await;
                return;
            }

            let batch = match self
                .meta
                .find_objects_needing_verification(started_at, self.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    log::error!("verify job batch fetch failed: {err}");
                    self.finish_run(false).await;
                    return;
                }
            };

            if batch.is_empty() {
                self.persist_completion(started_at).await;
                self.finish_run(true).await;
                return;
            }

            for record in batch {
                if shutdown.throw_if_aborted().is_err() {
                    self.finish_run(false).await;
                    return;
                }

                let volume_ids: Vec<VolumeId> = record
                    .data_volumes
                    .iter()
                    .chain(record.parity_volumes.iter())
                    .cloned()
                    .collect();
                let mut volumes = Vec::with_capacity(volume_ids.len());
                let mut all_present = true;
                for id in &volume_ids {
                    match self.fleet.get_volume(id).await {
                        Some(v) => volumes.push(v),
                        None => {
                            all_present = false;
                            break;
                        }
                    }
                }
                if !all_present {
                    continue;
                }

                let plan = Plan::build(
                    record.size,
                    record.chunk_size,
                    record.data_volumes.len() as u8,
                    record.parity_volumes.len() as u8,
                );
                let verifier = SliceVerifier::new(record.id, plan, volumes.clone());

                let mut slice_errors: HashMap<u8, SliceErrorRecord> = HashMap::new();
                let mut aborted = false;

                for s in 0..plan.total_slice_count() {
                    self.priority.wait_for_access(&volume_ids[s], Priority::Low).await;
                    match verifier.verify_slice(s, &shutdown).await {
                        Ok(VerifyOutcome::Ok) => {}
                        Ok(VerifyOutcome::ChecksumMismatch) => {
                            let kind = if s < record.data_volumes.len() { SliceKind::Data } else { SliceKind::Parity };
                            slice_errors.insert(s as u8, SliceErrorRecord { checksum: true, slice_kind: kind, message: None });
                            self.record_volume_error(&volumes[s], &volume_ids[s], true).await;
                        }
                        Ok(VerifyOutcome::IoError(message)) => {
                            let kind = if s < record.data_volumes.len() { SliceKind::Data } else { SliceKind::Parity };
                            slice_errors.insert(s as u8, SliceErrorRecord { checksum: false, slice_kind: kind, message: Some(message) });
                            self.record_volume_error(&volumes[s], &volume_ids[s], false).await;
                        }
                        Err(_abort) => {
                            aborted = true;
                            break;
                        }
                    }
                }

                if aborted {
                    self.finish_run(false).await;
                    return;
                }

                let errors_to_store = if slice_errors.is_empty() { None } else { Some(slice_errors.clone()) };
                self.meta
                    .update_object_verification_state(record.id, Some(started_at), errors_to_store)
                    .await
                    .ok();

                let mut status = self.status.lock().await;
                status.objects_verified += 1;
                status.total_errors += slice_errors.len() as u64;
                status.checksum_errors += slice_errors.values().filter(|e| e.checksum).count() as u64;
            }
        }
    }

    async fn record_volume_error(&self, volume: &Arc<crate::volume::Volume>, volume_id: &VolumeId, is_checksum: bool) {
        volume.record_verify_error(is_checksum);
        self.meta.set_volume_verify_errors(volume_id, volume.verify_errors()).await.ok();
        let mut status = self.status.lock().await;
        *status.volume_errors.entry(volume_id.clone()).or_insert(0) += 1;
    }

    async fn persist_completion(&self, started_at: u64) {
        let status = self.status.lock().await.clone();
        let payload = format!(
            "{{\"startedAt\":{},\"checksumErrors\":{},\"totalErrors\":{},\"finishedAt\":{}}}",
            started_at,
            status.checksum_errors,
            status.total_errors,
            now_unix()
        );
        self.config_store.set(LAST_VERIFY_KEY, payload).await.ok();
        self.config_store.delete(VERIFY_STARTED_AT_KEY).await.ok();
    }

    async fn finish_run(&self, completed: bool) {
        *self.run.lock().await = None;
        let mut status = self.status.lock().await;
        status.running = false;
        let _ = completed;
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ContainerEntry, MetaStoreError, StoredObjectRecord};
    use crate::config::Config;
    use crate::domain::ObjectId;
    use crate::domain::SliceIndex;
    use crate::volume::{DirectoryMounter, Volume};
    use crate::writer::Writer;
    use crate::slice::Slice;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct InMemoryMeta {
        records: StdMutex<HashMap<ObjectId, StoredObjectRecord>>,
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
        async fn get_objects_in_container_path(&self, _path: &str) -> Result<Vec<ContainerEntry>, MetaStoreError> {
            Ok(Vec::new())
        }
        async fn get_or_create_container(&self, _path: &str) -> Result<Option<String>, MetaStoreError> {
            Ok(None)
        }
        async fn find_objects_needing_verification(&self, started_at: u64, limit: usize) -> Result<Vec<StoredObjectRecord>, MetaStoreError> {
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
        async fn set_volume_verify_errors(&self, _volume_id: &VolumeId, _errors: Option<crate::volume::VerifyErrorCounts>) -> Result<(), MetaStoreError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct InMemoryConfig {
        values: StdMutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl RuntimeConfigStore for InMemoryConfig {
        async fn get(&self, key: &str) -> Result<Option<String>, crate::collaborators::ConfigStoreError> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }
        async fn set(&self, key: &str, value: String) -> Result<(), crate::collaborators::ConfigStoreError> {
            self.values.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), crate::collaborators::ConfigStoreError> {
            self.values.lock().unwrap().remove(key);
            Ok(())
        }
    }

    struct FixedFleet(Vec<Arc<Volume>>);

    #[async_trait]
    impl VolumeFleet for FixedFleet {
        async fn get_volume(&self, id: &VolumeId) -> Option<Arc<Volume>> {
            self.0.iter().find(|v| &v.id == id).cloned()
        }
        async fn get_volume_entries(&self) -> Vec<(VolumeId, Arc<Volume>)> {
            self.0.iter().map(|v| (v.id.clone(), v.clone())).collect()
        }
        async fn get_writable_volumes(&self) -> Vec<Arc<Volume>> {
            self.0.iter().filter(|v| v.is_writable()).cloned().collect()
        }
    }

    async fn write_object(
        payload: &[u8],
        config: &Config,
        dir: &std::path::Path,
    ) -> (StoredObjectRecord, Vec<Arc<Volume>>) {
        let plan = Plan::build(payload.len() as u64, config.chunk_size, config.data_slice_count, config.parity_slice_count);
        let object_id = ObjectId::generate();
        let total = config.data_slice_count as usize + config.parity_slice_count as usize;
        let mut volumes = Vec::with_capacity(total);
        let mut slices = Vec::with_capacity(total);
        for i in 0..total {
            let volume = Arc::new(Volume::new(
                VolumeId::new(format!("vol-{i}")),
                uuid::Uuid::nil(),
                i as u8,
                dir.join(format!("vol-{i}")),
                "usb0".to_string(),
                10_000_000,
            ));
            volume.start(&DirectoryMounter, [0u8; 16]).await.unwrap();
            let slice = Slice::create(
                volume.clone(),
                object_id,
                SliceIndex::new(i as u8),
                config.data_slice_count,
                config.parity_slice_count,
                config.chunk_size,
                plan.file_size,
                plan.slice_size,
            )
            .await
            .unwrap();
            volumes.push(volume);
            slices.push(slice);
        }
        let mut writer = Writer::prepare(plan, slices).await.unwrap();
        writer.write(payload).await.unwrap();
        let md5 = writer.finish().await.unwrap();
        writer.commit().await.unwrap();

        let record = StoredObjectRecord {
            id: object_id,
            container_id: None,
            name: "obj".to_string(),
            size: plan.file_size,
            chunk_size: plan.chunk_size,
            data_volumes: volumes[..config.data_slice_count as usize].iter().map(|v| v.id.clone()).collect(),
            parity_volumes: volumes[config.data_slice_count as usize..].iter().map(|v| v.id.clone()).collect(),
            md5,
            mime: None,
            unavailable_slices: Vec::new(),
            damaged_slices: Vec::new(),
            last_verified_at: None,
            slice_errors: HashMap::new(),
        };
        (record, volumes)
    }

    #[tokio::test]
    async fn verifies_clean_object_and_persists_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_slice_count = 2;
        config.parity_slice_count = 1;
        config.chunk_size = 128;

        let (record, volumes) = write_object(b"clean payload for verify", &config, dir.path()).await;
        let meta = Arc::new(InMemoryMeta::default());
        meta.create_object_record(record.clone()).await.unwrap();
        let config_store = Arc::new(InMemoryConfig::default());
        let fleet = Arc::new(FixedFleet(volumes));
        let priority = Arc::new(VolumePriority::new());

        let job = Arc::new(VerifyJob::new(meta.clone(), config_store.clone(), fleet, priority, 16));
        job.start().await;

        for _ in 0..50 {
            if !job.status().await.running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let stored = meta.get_object_by_id(record.id).await.unwrap().unwrap();
        assert!(stored.last_verified_at.is_some());
        assert!(stored.slice_errors.is_empty());
        assert_eq!(job.status().await.objects_verified, 1);
        assert!(config_store.get("lastVerify").await.unwrap().is_some());
        assert!(config_store.get(VERIFY_STARTED_AT_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_start_while_running_returns_same_started_at() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { data_slice_count: 1, parity_slice_count: 1, chunk_size: 128, ..Config::default() };
        let (record, volumes) = write_object(b"x", &config, dir.path()).await;
        let meta = Arc::new(InMemoryMeta::default());
        meta.create_object_record(record).await.unwrap();
        let config_store = Arc::new(InMemoryConfig::default());
        let fleet = Arc::new(FixedFleet(volumes));
        let priority = Arc::new(VolumePriority::new());

        let job = Arc::new(VerifyJob::new(meta, config_store, fleet, priority, 16));
        let first = job.start().await;
        let second = job.start().await;
        assert_eq!(first, second);
    }
}
