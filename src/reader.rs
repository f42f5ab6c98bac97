//! Read pipeline: direct reads from data slices, or chunk-set reconstruction
//! from parity when a data slice is unavailable (spec §4.4).

use crate::domain::{ObjectId, SliceIndex};
use crate::plan::{ChunkSetRegion, Plan};
use crate::rs_codec::Codec;
use crate::slice::{Slice, SliceError};
use crate::volume::Volume;
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("not enough readable slices to reconstruct the missing data")]
    InsufficientSlices,
    #[error("read range start must not exceed end")]
    MisalignedRange,
    #[error("no reconstructed chunk-set buffer for the current chunk set")]
    ChunkSetBufferMissing,
    #[error("slice read failed: {cause}")]
    SliceReadFailed { cause: SliceError },
}

/// Serves byte ranges of a committed object, reconstructing missing data
/// slices from parity on the fly.
pub struct Reader {
    plan: Plan,
    codec: Codec,
    open_slices: HashMap<usize, Slice>,
    missing_data_indices: Vec<usize>,
    must_reconstruct: bool,

    start: u64,
    end: u64,
    current_chunk_set_index: u64,
    current_slice_within_set: usize,
    has_read_segment: bool,
    reconstructed_cache: Option<(u64, Vec<Vec<u8>>)>,
}

impl Reader {
    /// `volumes` must be ordered `[data slices..., parity slices...]`,
    /// length `D+P`. `unavailable` names slice indices the caller already
    /// knows are bad (`unavailableSlices ∪ damagedSlices` on the record).
    pub async fn prepare(
        plan: Plan,
        object_id: ObjectId,
        volumes: &[Arc<Volume>],
        unavailable: &[u8],
    ) -> Result<Reader, ReaderError> {
        let d = plan.data_slice_count as usize;
        let mut open_slices = HashMap::default();
        let mut missing = Vec::new();

        for i in 0..d {
            let volume = &volumes[i];
            if volume.is_readable() && !unavailable.contains(&(i as u8)) {
                let slice = open_one(&plan, object_id, volume.clone(), i as u8).await?;
                open_slices.insert(i, slice);
            } else {
                missing.push(i);
            }
        }

        let must_reconstruct = !missing.is_empty();
        if must_reconstruct {
            let mut recruited = 0;
            for p in d..volumes.len() {
                if recruited >= missing.len() {
                    break;
                }
                let volume = &volumes[p];
                if volume.is_readable() {
                    if let Ok(slice) = open_one(&plan, object_id, volume.clone(), p as u8).await {
                        open_slices.insert(p, slice);
                        recruited += 1;
                    }
                }
            }
            if recruited < missing.len() {
                return Err(ReaderError::InsufficientSlices);
            }
        }

        let codec = Codec::new(d, plan.parity_slice_count as usize);
        Ok(Reader {
            plan,
            codec,
            open_slices,
            missing_data_indices: missing,
            must_reconstruct,
            start: 0,
            end: 0,
            current_chunk_set_index: 0,
            current_slice_within_set: 0,
            has_read_segment: true,
            reconstructed_cache: None,
        })
    }

    /// Aligns the engine to `[start, end)` and seeks every open slice to the
    /// chunk containing (or immediately following, for slices not involved
    /// in a partial leading chunk set) that position.
    pub async fn set_read_range(&mut self, start: u64, end: u64) -> Result<(), ReaderError> {
        if start > end {
            return Err(ReaderError::MisalignedRange);
        }
        self.start = start;
        self.end = end;
        self.has_read_segment = start == end;
        self.reconstructed_cache = None;

        let (_, chunk_set_index, slice_within_set, _) = self.plan.locate_global(start);
        // Reconstruction always starts at a chunk-set boundary (spec §4.4).
        let slice_within_set = if self.must_reconstruct { 0 } else { slice_within_set };
        self.current_chunk_set_index = chunk_set_index;
        self.current_slice_within_set = slice_within_set;

        for (&idx, slice) in self.open_slices.iter_mut() {
            let seek_target = if idx < slice_within_set {
                chunk_set_index + 1
            } else {
                chunk_set_index
            };
            if seek_target < self.plan.chunk_set_count() {
                slice
                    .seek_to_chunk_set(&self.plan, seek_target)
                    .await
                    .map_err(|cause| ReaderError::SliceReadFailed { cause })?;
            }
        }
        Ok(())
    }

    /// Returns the next trimmed segment of `[start, end)`, or `None` once
    /// the range is exhausted.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ReaderError> {
        if self.has_read_segment {
            return Ok(None);
        }

        loop {
            if self.current_chunk_set_index >= self.plan.chunk_set_count() {
                self.has_read_segment = true;
                return Ok(None);
            }
            let region = self.plan.region_for_chunk_set(self.current_chunk_set_index);
            let chunk_data_size = self.plan.chunk_data_size(region);
            let slice_idx = self.current_slice_within_set;

            let raw = if self.must_reconstruct {
                self.reconstructed_chunk(slice_idx, region).await?
            } else {
                let slice = self
                    .open_slices
                    .get_mut(&slice_idx)
                    .ok_or(ReaderError::ChunkSetBufferMissing)?;
                slice
                    .read_chunk(region, &self.plan)
                    .await
                    .map_err(|cause| ReaderError::SliceReadFailed { cause })?
            };

            let chunk_start = self.plan.chunk_set_global_offset(self.current_chunk_set_index)
                + slice_idx as u64 * chunk_data_size;
            let chunk_end = chunk_start + chunk_data_size;

            self.advance_cursor();

            if chunk_start >= self.end {
                self.has_read_segment = true;
                return Ok(None);
            }
            if chunk_end <= self.start {
                continue;
            }

            let trim_start = self.start.saturating_sub(chunk_start) as usize;
            let trim_end = chunk_end.saturating_sub(self.end) as usize;
            let keep_end = raw.len().saturating_sub(trim_end);
            if trim_start >= keep_end {
                if chunk_end >= self.end {
                    self.has_read_segment = true;
                    return Ok(None);
                }
                continue;
            }

            let segment = raw[trim_start..keep_end].to_vec();
            if chunk_end >= self.end {
                self.has_read_segment = true;
            }
            return Ok(Some(segment));
        }
    }

    fn advance_cursor(&mut self) {
        self.current_slice_within_set += 1;
        if self.current_slice_within_set >= self.plan.data_slice_count as usize {
            self.current_slice_within_set = 0;
            self.current_chunk_set_index += 1;
        }
    }

    /// Computes (and caches) the full `D`-chunk reconstruction of the
    /// current chunk set, returning the `slice_idx`-th data chunk from it.
    async fn reconstructed_chunk(
        &mut self,
        slice_idx: usize,
        region: ChunkSetRegion,
    ) -> Result<Vec<u8>, ReaderError> {
        let needs_recompute = self
            .reconstructed_cache
            .as_ref()
            .map(|(cs, _)| *cs != self.current_chunk_set_index)
            .unwrap_or(true);

        if needs_recompute {
            let mut active_pairs: Vec<(usize, Vec<u8>)> = Vec::new();
            for (&idx, slice) in self.open_slices.iter_mut() {
                let payload = slice
                    .read_chunk(region, &self.plan)
                    .await
                    .map_err(|cause| ReaderError::SliceReadFailed { cause })?;
                active_pairs.push((idx, payload));
            }
            let active_refs: Vec<(usize, &[u8])> =
                active_pairs.iter().map(|(i, b)| (*i, b.as_slice())).collect();
            let decoded = self
                .codec
                .reconstruct(&active_refs, &self.missing_data_indices)
                .map_err(|_| ReaderError::InsufficientSlices)?;

            let mut full = Vec::with_capacity(self.plan.data_slice_count as usize);
            for d in 0..self.plan.data_slice_count as usize {
                if let Some(bytes) = decoded.get(&d) {
                    full.push(bytes.clone());
                } else {
                    let (_, bytes) = active_pairs.iter().find(|(idx, _)| *idx == d).expect(
                        "data index not in missing set must be present among active slices",
                    );
                    full.push(bytes.clone());
                }
            }
            self.reconstructed_cache = Some((self.current_chunk_set_index, full));
        }

        Ok(self.reconstructed_cache.as_ref().unwrap().1[slice_idx].clone())
    }

    /// Does not close synchronously — schedules the actual slice closes
    /// after a short delay so in-flight reads can settle (spec §4.4).
    /// Individual close failures are logged, not propagated.
    pub fn close(mut self) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            for (idx, slice) in self.open_slices.iter_mut() {
                if let Err(err) = slice.close().await {
                    log::warn!("error closing slice {idx} during reader close: {err}");
                }
            }
        });
    }
}

async fn open_one(
    plan: &Plan,
    object_id: ObjectId,
    volume: Arc<Volume>,
    slice_index: u8,
) -> Result<Slice, ReaderError> {
    Slice::open(
        volume,
        object_id,
        SliceIndex::new(slice_index),
        plan.data_slice_count,
        plan.parity_slice_count,
        plan.chunk_size,
    )
    .await
    .map_err(|cause| ReaderError::SliceReadFailed { cause })
}
