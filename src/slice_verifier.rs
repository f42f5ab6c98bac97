//! Per-slice re-read-and-checksum used by the VerifyJob (spec §4.7 step 4).

use crate::domain::{ObjectId, SliceIndex};
use crate::plan::Plan;
use crate::shutdown::{IoAbortError, IoShutdown};
use crate::slice::{Slice, SliceError};
use crate::volume::Volume;
use std::sync::Arc;

/// Outcome of re-reading one slice end-to-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    ChecksumMismatch,
    IoError(String),
}

/// Re-reads every chunk of every slice of one object, attributing a
/// checksum-vs-other-I/O outcome per slice.
pub struct SliceVerifier {
    object_id: ObjectId,
    plan: Plan,
    volumes: Vec<Arc<Volume>>,
}

impl SliceVerifier {
    /// `volumes` must be ordered `[data slices..., parity slices...]`.
    pub fn new(object_id: ObjectId, plan: Plan, volumes: Vec<Arc<Volume>>) -> Self {
        SliceVerifier { object_id, plan, volumes }
    }

    /// Checks the shutdown gate at the loop head and before each chunk read
    /// (spec §5's "loop heads, between slice ops" suspension points).
    pub async fn verify_slice(
        &self,
        slice_index: usize,
        shutdown: &IoShutdown,
    ) -> Result<VerifyOutcome, IoAbortError> {
        shutdown.throw_if_aborted()?;

        let volume = &self.volumes[slice_index];
        if !volume.is_readable() {
            return Ok(VerifyOutcome::IoError(format!("volume {} is not readable", volume.id)));
        }

        let mut slice = match Slice::open(
            volume.clone(),
            self.object_id,
            SliceIndex::new(slice_index as u8),
            self.plan.data_slice_count,
            self.plan.parity_slice_count,
            self.plan.chunk_size,
        )
        .await
        {
            Ok(slice) => slice,
            Err(err) => return Ok(VerifyOutcome::IoError(err.to_string())),
        };

        if let Err(err) = slice.seek_to_head().await {
            return Ok(VerifyOutcome::IoError(err.to_string()));
        }

        for chunk_set in 0..self.plan.chunk_set_count() {
            shutdown.throw_if_aborted()?;
            let region = self.plan.region_for_chunk_set(chunk_set);
            match slice.read_chunk(region, &self.plan).await {
                Ok(_) => {}
                Err(SliceError::Checksum { .. }) => {
                    slice.close().await.ok();
                    return Ok(VerifyOutcome::ChecksumMismatch);
                }
                Err(err) => {
                    slice.close().await.ok();
                    return Ok(VerifyOutcome::IoError(err.to_string()));
                }
            }
        }

        slice.close().await.ok();
        Ok(VerifyOutcome::Ok)
    }
}
