//! Write pipeline: buffer a chunk set, RS-encode parity, fan out to
//! `D+P` slices, track plaintext MD5 (spec §4.3).

use crate::checksum::{finalize_md5, new_md5_hasher};
use crate::plan::Plan;
use crate::rs_codec::Codec;
use crate::slice::{Slice, SliceError};
use md5::{Digest, Md5};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("wrote {actual} bytes, expected {expected}")]
    ByteCountMismatch { expected: u64, actual: u64 },
    #[error("write aborted")]
    Aborted,
    #[error("plaintext hash was never initialized")]
    HashNotInitialized,
    #[error("chunk-set buffer was never initialized")]
    BufferNotInitialized,
    #[error("slice write failed: {cause}")]
    SliceWriteFailed { cause: SliceError },
}

type SliceJoin = JoinHandle<Result<Slice, SliceError>>;

/// Fans a linear byte stream out across `D` data slices plus `P` RS parity
/// slices, one chunk set at a time.
pub struct Writer {
    slices: Vec<Option<Slice>>,
    in_flight: Vec<Option<SliceJoin>>,
    plan: Plan,
    codec: Codec,

    chunk_set_index: u64,
    chunk_data_size: u64,
    /// `D * chunk_data_size` bytes: the plaintext of the current chunk set.
    buffer: Vec<u8>,
    filled: u64,
    dispatched_data_count: usize,

    total_written: u64,
    hasher: Option<Md5>,
    aborting: Arc<AtomicBool>,
    first_error: Option<WriterError>,
    closed: bool,
}

impl Writer {
    /// `prepare`: `slices[i]` must already be in `create` mode, ordered
    /// `[data slices..., parity slices...]`.
    pub async fn prepare(plan: Plan, slices: Vec<Slice>) -> Result<Writer, WriterError> {
        let data_count = plan.data_slice_count as usize;
        let parity_count = plan.parity_slice_count as usize;
        let codec = Codec::new(data_count, parity_count);

        let region = plan.region_for_chunk_set(0);
        let chunk_data_size = plan.chunk_data_size(region);
        let in_flight_len = slices.len();

        let mut writer = Writer {
            slices: slices.into_iter().map(Some).collect(),
            in_flight: (0..in_flight_len).map(|_| None).collect(),
            plan,
            codec,
            chunk_set_index: 0,
            chunk_data_size,
            buffer: vec![0u8; data_count * chunk_data_size as usize],
            filled: 0,
            dispatched_data_count: 0,
            total_written: 0,
            hasher: Some(new_md5_hasher()),
            aborting: Arc::new(AtomicBool::new(false)),
            first_error: None,
            closed: false,
        };
        writer.flush_trivially_empty_sets().await?;
        Ok(writer)
    }

    fn data_count(&self) -> usize {
        self.plan.data_slice_count as usize
    }

    /// Accept the next slab of plaintext bytes.
    pub async fn write(&mut self, mut buf: &[u8]) -> Result<(), WriterError> {
        while !buf.is_empty() {
            let capacity = self.buffer.len() as u64;
            let room = capacity - self.filled;
            let take = room.min(buf.len() as u64) as usize;

            self.buffer[self.filled as usize..self.filled as usize + take]
                .copy_from_slice(&buf[..take]);
            self.hasher
                .as_mut()
                .ok_or(WriterError::HashNotInitialized)?
                .update(&buf[..take]);
            self.filled += take as u64;
            self.total_written += take as u64;
            buf = &buf[take..];

            self.dispatch_completed_data_slices().await?;
            if self.filled == capacity {
                self.dispatch_parity_and_advance().await?;
            }
        }
        Ok(())
    }

    /// Queue a write for every data-slice chunk that just became fully
    /// filled, in index order.
    async fn dispatch_completed_data_slices(&mut self) -> Result<(), WriterError> {
        if self.chunk_data_size == 0 {
            return Ok(());
        }
        let completed = (self.filled / self.chunk_data_size) as usize;
        for index in self.dispatched_data_count..completed.min(self.data_count()) {
            let start = index * self.chunk_data_size as usize;
            let end = start + self.chunk_data_size as usize;
            let payload = self.buffer[start..end].to_vec();
            self.queue_slice_write(index, payload).await?;
        }
        self.dispatched_data_count = completed.min(self.data_count());
        Ok(())
    }

    /// Once all `D` data chunks in the set are queued: RS-encode parity and
    /// queue the parity writes, then advance to the next chunk set.
    async fn dispatch_parity_and_advance(&mut self) -> Result<(), WriterError> {
        if self.plan.parity_slice_count > 0 && self.chunk_data_size > 0 {
            let data_refs: Vec<&[u8]> = (0..self.data_count())
                .map(|i| {
                    let start = i * self.chunk_data_size as usize;
                    &self.buffer[start..start + self.chunk_data_size as usize]
                })
                .collect();
            let parity = self
                .codec
                .encode_parity(&data_refs)
                .expect("writer always presents data_count equal-length even chunks");
            for (p, payload) in parity.into_iter().enumerate() {
                self.queue_slice_write(self.data_count() + p, payload).await?;
            }
        }
        self.advance_chunk_set().await
    }

    async fn advance_chunk_set(&mut self) -> Result<(), WriterError> {
        self.chunk_set_index += 1;
        self.dispatched_data_count = 0;
        self.filled = 0;
        if self.chunk_set_index < self.plan.chunk_set_count() {
            let region = self.plan.region_for_chunk_set(self.chunk_set_index);
            self.chunk_data_size = self.plan.chunk_data_size(region);
            self.buffer = vec![0u8; self.data_count() * self.chunk_data_size as usize];
        }
        self.flush_trivially_empty_sets().await
    }

    /// Dispatches (empty) chunk sets whose region has a zero-byte chunk
    /// size outright — the terminal *end* region when the file's size
    /// divides the preceding regions exactly (spec §3's `endChunkDataSize`
    /// can be 0).
    async fn flush_trivially_empty_sets(&mut self) -> Result<(), WriterError> {
        while self.chunk_set_index < self.plan.chunk_set_count() && self.chunk_data_size == 0 {
            for index in 0..self.data_count() {
                self.queue_slice_write(index, Vec::new()).await?;
            }
            if self.plan.parity_slice_count > 0 {
                let empty: Vec<&[u8]> = (0..self.data_count()).map(|_| &[][..]).collect();
                let parity = self.codec.encode_parity(&empty).unwrap_or_default();
                for (p, payload) in parity.into_iter().enumerate() {
                    self.queue_slice_write(self.data_count() + p, payload).await?;
                }
            }
            self.chunk_set_index += 1;
            self.dispatched_data_count = 0;
            self.filled = 0;
            if self.chunk_set_index < self.plan.chunk_set_count() {
                let region = self.plan.region_for_chunk_set(self.chunk_set_index);
                self.chunk_data_size = self.plan.chunk_data_size(region);
                self.buffer = vec![0u8; self.data_count() * self.chunk_data_size as usize];
            }
        }
        Ok(())
    }

    /// At most one outstanding write per slice index: await whatever is
    /// already in flight for `index` before dispatching the new one.
    async fn queue_slice_write(&mut self, index: usize, payload: Vec<u8>) -> Result<(), WriterError> {
        self.reclaim_slice(index).await?;

        // Best-effort abort check (spec §9 open question): a race here is
        // accepted; cleanup unconditionally deletes every slice file.
        if self.aborting.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut slice = self.slices[index].take().ok_or(WriterError::BufferNotInitialized)?;
        let handle: SliceJoin = tokio::spawn(async move {
            slice.write_chunk(&payload).await?;
            Ok(slice)
        });
        self.in_flight[index] = Some(handle);
        Ok(())
    }

    /// Await any outstanding write for `index` and fold the slice back into
    /// `self.slices`, recording (but not propagating) a first failure.
    async fn reclaim_slice(&mut self, index: usize) -> Result<(), WriterError> {
        if let Some(handle) = self.in_flight[index].take() {
            match handle.await {
                Ok(Ok(slice)) => self.slices[index] = Some(slice),
                Ok(Err(cause)) => {
                    self.first_error.get_or_insert(WriterError::SliceWriteFailed { cause });
                }
                Err(join_err) => {
                    self.first_error.get_or_insert(WriterError::SliceWriteFailed {
                        cause: SliceError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            join_err.to_string(),
                        )),
                    });
                }
            }
        }
        Ok(())
    }

    async fn reclaim_all(&mut self) -> Result<(), WriterError> {
        for index in 0..self.slices.len() {
            self.reclaim_slice(index).await?;
        }
        Ok(())
    }

    /// Zero-pad any partially filled tail chunk set and flush it, await
    /// every outstanding write, and finalize the plaintext MD5.
    pub async fn finish(&mut self) -> Result<[u8; 16], WriterError> {
        if self.total_written != self.plan.file_size {
            return Err(WriterError::ByteCountMismatch {
                expected: self.plan.file_size,
                actual: self.total_written,
            });
        }
        if self.filled > 0 {
            // Buffer bytes beyond `filled` are already zero from allocation.
            self.dispatch_completed_data_slices_up_to_capacity().await?;
            self.dispatch_parity_and_advance().await?;
        }
        self.reclaim_all().await?;

        if let Some(err) = self.first_error.take() {
            return Err(err);
        }
        let hasher = self.hasher.take().ok_or(WriterError::HashNotInitialized)?;
        Ok(finalize_md5(hasher))
    }

    async fn dispatch_completed_data_slices_up_to_capacity(&mut self) -> Result<(), WriterError> {
        self.filled = self.buffer.len() as u64;
        self.dispatch_completed_data_slices().await
    }

    /// Close all slices, rename temp → committed, credit volume counters.
    pub async fn commit(&mut self) -> Result<(), WriterError> {
        self.reclaim_all().await?;
        if let Some(err) = self.first_error.take() {
            return Err(err);
        }
        if self.aborting.load(Ordering::Acquire) {
            return Err(WriterError::Aborted);
        }

        for slot in self.slices.iter_mut() {
            if let Some(slice) = slot {
                slice.close().await.map_err(|cause| WriterError::SliceWriteFailed { cause })?;
            }
        }
        if self.aborting.load(Ordering::Acquire) {
            return Err(WriterError::Aborted);
        }
        for slot in self.slices.iter_mut() {
            if let Some(slice) = slot {
                slice.commit().await.map_err(|cause| WriterError::SliceWriteFailed { cause })?;
            }
        }
        self.closed = true;
        Ok(())
    }

    /// Stop taking new writes, await in-flight ones, and delete every slice
    /// (committed file if it got that far, otherwise the temp file);
    /// reservations are released by `Slice::delete`.
    pub async fn abort(&mut self) {
        self.aborting.store(true, Ordering::Release);
        self.reclaim_all().await.ok();
        for slot in self.slices.iter_mut() {
            if let Some(slice) = slot {
                slice.delete().await.ok();
            }
        }
        self.closed = true;
    }

    pub fn aborting_handle(&self) -> Arc<AtomicBool> {
        self.aborting.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ObjectId, SliceIndex, VolumeId};
    use crate::volume::{DirectoryMounter, Volume};
    use std::sync::Arc as StdArc;

    async fn slices_for(plan: &Plan, object_id: ObjectId, dir: &std::path::Path) -> Vec<Slice> {
        let total = plan.data_slice_count as usize + plan.parity_slice_count as usize;
        let mut slices = Vec::with_capacity(total);
        for i in 0..total {
            let volume = StdArc::new(Volume::new(
                VolumeId::new(format!("vol-{i}")),
                uuid::Uuid::nil(),
                i as u8,
                dir.join(format!("vol-{i}")),
                "usb0".to_string(),
                10_000_000,
            ));
            volume.start(&DirectoryMounter, [0u8; 16]).await.unwrap();
            let slice = Slice::create(
                volume,
                object_id,
                SliceIndex::new(i as u8),
                plan.data_slice_count,
                plan.parity_slice_count,
                plan.chunk_size,
                plan.file_size,
                plan.slice_size,
            )
            .await
            .unwrap();
            slices.push(slice);
        }
        slices
    }

    #[tokio::test]
    async fn small_write_commits_and_hashes_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"hello strubs";
        let plan = Plan::build(payload.len() as u64, 128, 2, 1);
        let object_id = ObjectId::generate();
        let slices = slices_for(&plan, object_id, dir.path()).await;

        let mut writer = Writer::prepare(plan, slices).await.unwrap();
        writer.write(payload).await.unwrap();
        let digest = writer.finish().await.unwrap();
        assert_eq!(digest, crate::checksum::compute_md5(payload));
        writer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn byte_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let plan = Plan::build(12, 128, 2, 1);
        let object_id = ObjectId::generate();
        let slices = slices_for(&plan, object_id, dir.path()).await;

        let mut writer = Writer::prepare(plan, slices).await.unwrap();
        writer.write(b"too short").await.unwrap();
        let err = writer.finish().await.unwrap_err();
        assert!(matches!(err, WriterError::ByteCountMismatch { .. }));
    }

    #[tokio::test]
    async fn abort_leaves_no_temp_files_and_releases_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let plan = Plan::build(5, 32, 4, 2);
        let object_id = ObjectId::generate();
        let slices = slices_for(&plan, object_id, dir.path()).await;
        let volumes: Vec<_> = slices.iter().map(|s| s.volume().clone()).collect();

        let mut writer = Writer::prepare(plan, slices).await.unwrap();
        writer.write(b"hello").await.unwrap();
        writer.abort().await;

        for volume in volumes {
            assert_eq!(volume.bytes_pending(), 0);
        }
    }
}
