//! `FileObject` state machine (spec §4.6): the write path
//! (`Empty → Writing → Persisted → Closed`), the read path
//! (`Empty → Loaded → Reading → Closed`), and the shared `→ Deleted` edge.
//!
//! Wires together `Planner`, `Writer`, `Reader`, and `destroyer::destroy`
//! against the `ObjectMetaStore` collaborator. A `FileObject` carries its
//! priority and an optional request id purely for logging attribution —
//! neither participates in any transition.

use crate::collaborators::{MetaStoreError, ObjectMetaStore, StoredObjectRecord, VolumeFleet};
use crate::destroyer;
use crate::domain::{ObjectId, SliceIndex};
use crate::plan::Plan;
use crate::planner::{Assignment, PlanError, Planner};
use crate::priority::Priority;
use crate::reader::{Reader, ReaderError};
use crate::slice::{Slice, SliceError};
use crate::volume::Volume;
use crate::writer::{Writer, WriterError};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Empty,
    Writing,
    Persisted,
    Loaded,
    Reading,
    Closed,
    Deleted,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal operation for the current file-object state")]
    InvalidState,
    #[error("file object state was never initialized")]
    NotInitialized,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Slice(#[from] SliceError),
    #[error(transparent)]
    Writer(#[from] WriterError),
}

#[derive(Debug, thiserror::Error)]
pub enum FileObjectError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Create(#[from] CreateError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Meta(#[from] MetaStoreError),
}

/// A strictly FIFO async mutex: `acquireIOLock`/`releaseIOLock` (spec §9),
/// implemented as a queue of `oneshot` wakers so no waiter can jump ahead
/// of one that queued earlier — release pops the head and signals it.
pub struct IoLock {
    state: std::sync::Mutex<IoLockState>,
}

#[derive(Default)]
struct IoLockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Default for IoLock {
    fn default() -> Self {
        IoLock::new()
    }
}

impl IoLock {
    pub fn new() -> Self {
        IoLock {
            state: std::sync::Mutex::new(IoLockState::default()),
        }
    }

    pub async fn acquire(&self) -> IoLockGuard<'_> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if !state.locked {
                state.locked = true;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            rx.await.ok();
        }
        IoLockGuard { lock: self }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        match state.waiters.pop_front() {
            Some(next) => {
                next.send(()).ok();
            }
            None => state.locked = false,
        }
    }
}

pub struct IoLockGuard<'a> {
    lock: &'a IoLock,
}

impl Drop for IoLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A single object's write-or-read session, backed by the Planner/Writer or
/// the Reader depending on which path it entered.
pub struct FileObject<F: VolumeFleet, M: ObjectMetaStore> {
    planner: Arc<Planner<F>>,
    meta: Arc<M>,
    pub priority: Priority,
    pub request_id: Option<String>,
    io_lock: IoLock,

    phase: Phase,
    object_id: Option<ObjectId>,
    plan: Option<Plan>,
    volumes: Vec<Arc<Volume>>,
    record: Option<StoredObjectRecord>,
    unavailable: Vec<u8>,
    was_ever_persisted: bool,
    md5: Option<[u8; 16]>,

    writer: Option<Writer>,
    reader: Option<Reader>,
}

impl<F: VolumeFleet, M: ObjectMetaStore> FileObject<F, M> {
    pub fn new(
        planner: Arc<Planner<F>>,
        meta: Arc<M>,
        priority: Priority,
        request_id: Option<String>,
    ) -> Self {
        FileObject {
            planner,
            meta,
            priority,
            request_id,
            io_lock: IoLock::new(),
            phase: Phase::Empty,
            object_id: None,
            plan: None,
            volumes: Vec::new(),
            record: None,
            unavailable: Vec::new(),
            was_ever_persisted: false,
            md5: None,
            writer: None,
            reader: None,
        }
    }

    fn require_phase(&self, expected: Phase) -> Result<(), StateError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(StateError::InvalidState)
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.object_id
    }

    pub async fn acquire_io_lock(&self) -> IoLockGuard<'_> {
        self.io_lock.acquire().await
    }

    /// `createWithSize(size)`: ask the Planner for `D+P` volumes, create a
    /// `Slice` on each, and hand them to a fresh `Writer`. Any failure aborts
    /// whatever slices were already created and leaves the object `Empty`.
    pub async fn create_with_size(&mut self, size: u64) -> Result<(), CreateError> {
        if self.phase != Phase::Empty {
            return Err(self_err());
        }

        let object_id = ObjectId::generate();
        let assignment: Assignment = self.planner.plan(size).await?;
        let plan = assignment.plan;
        let volumes: Vec<Arc<Volume>> = assignment
            .data_volumes
            .iter()
            .chain(assignment.parity_volumes.iter())
            .cloned()
            .collect();

        let mut created = Vec::with_capacity(volumes.len());
        for (i, volume) in volumes.iter().enumerate() {
            // The Planner already reserved `plan.slice_size` on every picked
            // volume; `Slice::create` reserves again under its own
            // bookkeeping, so hand the provisional reservation off instead
            // of double-counting it.
            volume.release_reservation(plan.slice_size);
            match Slice::create(
                volume.clone(),
                object_id,
                SliceIndex::new(i as u8),
                plan.data_slice_count,
                plan.parity_slice_count,
                plan.chunk_size,
                plan.file_size,
                plan.slice_size,
            )
            .await
            {
                Ok(slice) => created.push(slice),
                Err(cause) => {
                    for mut slice in created {
                        slice.delete().await.ok();
                    }
                    for volume in &volumes[i..] {
                        volume.release_reservation(plan.slice_size);
                    }
                    return Err(CreateError::Slice(cause));
                }
            }
        }

        let writer = Writer::prepare(plan, created).await?;

        self.object_id = Some(object_id);
        self.plan = Some(plan);
        self.volumes = volumes;
        self.writer = Some(writer);
        self.phase = Phase::Writing;
        Ok(())
    }

    /// `write(chunk)`: delegate to the Writer.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), FileObjectError> {
        self.require_phase(Phase::Writing)?;
        self.writer
            .as_mut()
            .ok_or(StateError::NotInitialized)?
            .write(buf)
            .await?;
        Ok(())
    }

    /// `finish()`: pad/flush the tail chunk set and finalize the plaintext
    /// MD5, stashed for `commit()`.
    pub async fn finish(&mut self) -> Result<[u8; 16], FileObjectError> {
        self.require_phase(Phase::Writing)?;
        let md5 = self.writer.as_mut().ok_or(StateError::NotInitialized)?.finish().await?;
        self.md5 = Some(md5);
        Ok(md5)
    }

    /// `commit()`: commit every slice, then atomically insert the
    /// `StoredObjectRecord`.
    pub async fn commit(
        &mut self,
        name: impl Into<String>,
        container_id: Option<String>,
        mime: Option<String>,
    ) -> Result<ObjectId, FileObjectError> {
        self.require_phase(Phase::Writing)?;
        self.writer
            .as_mut()
            .ok_or(StateError::NotInitialized)?
            .commit()
            .await?;

        let object_id = self.object_id.ok_or(StateError::NotInitialized)?;
        let plan = self.plan.ok_or(StateError::NotInitialized)?;
        let md5 = self.md5.ok_or(StateError::NotInitialized)?;
        let data_count = plan.data_slice_count as usize;

        let record = StoredObjectRecord {
            id: object_id,
            container_id,
            name: name.into(),
            size: plan.file_size,
            chunk_size: plan.chunk_size,
            data_volumes: self.volumes[..data_count].iter().map(|v| v.id.clone()).collect(),
            parity_volumes: self.volumes[data_count..].iter().map(|v| v.id.clone()).collect(),
            md5,
            mime,
            unavailable_slices: Vec::new(),
            damaged_slices: Vec::new(),
            last_verified_at: None,
            slice_errors: std::collections::HashMap::new(),
        };
        self.meta.create_object_record(record.clone()).await?;

        self.record = Some(record);
        self.was_ever_persisted = true;
        self.phase = Phase::Persisted;
        Ok(object_id)
    }

    /// `loadFromRecord(record)`: rebuild the `Plan` and mark
    /// `unavailableSlices ∪ damagedSlices` as unreadable up front.
    pub fn load_from_record(
        &mut self,
        record: StoredObjectRecord,
        volumes: Vec<Arc<Volume>>,
    ) -> Result<(), StateError> {
        self.require_phase(Phase::Empty)?;
        let plan = Plan::build(
            record.size,
            record.chunk_size,
            record.data_volumes.len() as u8,
            record.parity_volumes.len() as u8,
        );

        let mut unavailable: Vec<u8> = record
            .unavailable_slices
            .iter()
            .chain(record.damaged_slices.iter())
            .cloned()
            .collect();
        unavailable.sort_unstable();
        unavailable.dedup();

        self.object_id = Some(record.id);
        self.plan = Some(plan);
        self.volumes = volumes;
        self.unavailable = unavailable;
        self.record = Some(record);
        self.was_ever_persisted = true;
        self.phase = Phase::Loaded;
        Ok(())
    }

    /// `prepareForRead()`: open every available slice and recruit parity
    /// slices if any data slice is unavailable.
    pub async fn prepare_for_read(&mut self) -> Result<(), FileObjectError> {
        self.require_phase(Phase::Loaded)?;
        let plan = self.plan.ok_or(StateError::NotInitialized)?;
        let object_id = self.object_id.ok_or(StateError::NotInitialized)?;
        let reader = Reader::prepare(plan, object_id, &self.volumes, &self.unavailable).await?;
        self.reader = Some(reader);
        self.phase = Phase::Reading;
        Ok(())
    }

    pub async fn set_read_range(&mut self, start: u64, end: u64) -> Result<(), FileObjectError> {
        self.require_phase(Phase::Reading)?;
        self.reader
            .as_mut()
            .ok_or(StateError::NotInitialized)?
            .set_read_range(start, end)
            .await?;
        Ok(())
    }

    /// Pull-based chunk delivery: `None` once the range is exhausted.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, FileObjectError> {
        self.require_phase(Phase::Reading)?;
        Ok(self.reader.as_mut().ok_or(StateError::NotInitialized)?.read_chunk().await?)
    }

    /// `delete()`: abort an in-flight write, or destroy every committed
    /// slice and drop the metadata row if one was ever persisted.
    pub async fn delete(&mut self) -> Result<(), FileObjectError> {
        match self.phase {
            Phase::Writing => {
                if let Some(mut writer) = self.writer.take() {
                    writer.abort().await;
                }
            }
            Phase::Persisted | Phase::Loaded | Phase::Reading => {
                let object_id = self.object_id.ok_or(StateError::NotInitialized)?;
                let plan = self.plan.ok_or(StateError::NotInitialized)?;
                let mut slices = Vec::with_capacity(self.volumes.len());
                for (i, volume) in self.volumes.iter().enumerate() {
                    match Slice::open(
                        volume.clone(),
                        object_id,
                        SliceIndex::new(i as u8),
                        plan.data_slice_count,
                        plan.parity_slice_count,
                        plan.chunk_size,
                    )
                    .await
                    {
                        Ok(slice) => slices.push(slice),
                        Err(err) => {
                            log::warn!("failed to open slice {i} of object {object_id} for delete: {err}");
                        }
                    }
                }
                destroyer::destroy(slices).await;

                if self.was_ever_persisted {
                    self.meta.delete_object_by_id(object_id).await?;
                }
            }
            Phase::Empty | Phase::Closed | Phase::Deleted => return Err(StateError::InvalidState.into()),
        }
        self.phase = Phase::Deleted;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), StateError> {
        match self.phase {
            Phase::Writing | Phase::Persisted | Phase::Loaded => {
                self.phase = Phase::Closed;
                Ok(())
            }
            Phase::Reading => {
                if let Some(reader) = self.reader.take() {
                    reader.close();
                }
                self.phase = Phase::Closed;
                Ok(())
            }
            Phase::Empty | Phase::Closed | Phase::Deleted => Err(StateError::InvalidState),
        }
    }
}

fn self_err() -> CreateError {
    CreateError::State(StateError::InvalidState)
}
