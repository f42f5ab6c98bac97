//! Pure derivation of slice/chunk layout from `(fileSize, chunkSize, D, P)`.
//!
//! A `Plan` is purely a function of its four inputs (spec §3 invariant) — no
//! I/O, no randomness, nothing volume-related. The Planner (`planner.rs`)
//! layers volume selection on top of this.

use crate::format::{ceil_div, round_up_to_8, CHUNK_HEADER_SIZE, FILE_HEADER_SIZE};

/// The three chunk-set regions a slice is divided into, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSetRegion {
    Start,
    Standard,
    End,
}

/// Layout of one object's slices, derived once per write/read and otherwise
/// immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub file_size: u64,
    pub chunk_size: u32,
    pub data_slice_count: u8,
    pub parity_slice_count: u8,

    /// Payload size of the (always-present) start chunk, per data slice.
    pub start_chunk_data_size: u64,
    /// Payload size of every standard (interior) chunk, per data slice.
    pub standard_chunk_data_size: u64,
    /// Number of whole standard chunk sets between the start and end sets.
    pub standard_chunk_count_per_slice: u64,
    /// Payload size of the (always-present) end chunk, per data slice.
    pub end_chunk_data_size: u64,

    /// Reserved on-disk capacity for a single slice file (used for
    /// `Volume::reserveSpace`, not the literal chunk layout below it).
    pub slice_size: u64,
}

impl Plan {
    /// Build the plan for a given file size against a fixed chunk size and
    /// slice counts. `chunk_size` must leave room for at least one byte of
    /// start-chunk payload per data slice (`chunk_size > CHUNK_HEADER_SIZE +
    /// FILE_HEADER_SIZE`), which every sane configuration satisfies.
    pub fn build(file_size: u64, chunk_size: u32, data_slice_count: u8, parity_slice_count: u8) -> Plan {
        assert!(data_slice_count >= 1, "data_slice_count must be at least 1");
        let d = data_slice_count as u64;

        let standard_chunk_data_size = chunk_size as u64 - CHUNK_HEADER_SIZE;
        let start_budget = standard_chunk_data_size.saturating_sub(FILE_HEADER_SIZE);
        let per_slice_share = file_size / d;
        let start_chunk_data_size = round_up_to_8(start_budget.min(per_slice_share).max(1));

        let standard_chunk_set_offset = start_chunk_data_size * d;
        let remaining = file_size.saturating_sub(standard_chunk_set_offset);

        let standard_chunk_set_bytes = standard_chunk_data_size * d;
        let (standard_chunk_count_per_slice, standard_bytes_used) = if standard_chunk_set_bytes > 0 {
            let count = remaining / standard_chunk_set_bytes;
            (count, count * standard_chunk_set_bytes)
        } else {
            (0, 0)
        };

        let end_remaining = remaining - standard_bytes_used;
        let end_chunk_data_size = round_up_to_8(ceil_div(end_remaining, d));

        let slice_size = FILE_HEADER_SIZE
            + ceil_div(file_size, d)
            + CHUNK_HEADER_SIZE * (1 + standard_chunk_count_per_slice + 1);

        Plan {
            file_size,
            chunk_size,
            data_slice_count,
            parity_slice_count,
            start_chunk_data_size,
            standard_chunk_data_size,
            standard_chunk_count_per_slice,
            end_chunk_data_size,
            slice_size,
        }
    }

    pub fn total_slice_count(&self) -> usize {
        self.data_slice_count as usize + self.parity_slice_count as usize
    }

    /// Total number of chunk sets (start + standard + end) in this plan.
    pub fn chunk_set_count(&self) -> u64 {
        2 + self.standard_chunk_count_per_slice
    }

    /// Which region a chunk-set index (0-based, start set first) falls in.
    pub fn region_for_chunk_set(&self, chunk_set_index: u64) -> ChunkSetRegion {
        if chunk_set_index == 0 {
            ChunkSetRegion::Start
        } else if chunk_set_index <= self.standard_chunk_count_per_slice {
            ChunkSetRegion::Standard
        } else {
            ChunkSetRegion::End
        }
    }

    /// Per-data-slice payload size of a chunk in the given region.
    pub fn chunk_data_size(&self, region: ChunkSetRegion) -> u64 {
        match region {
            ChunkSetRegion::Start => self.start_chunk_data_size,
            ChunkSetRegion::Standard => self.standard_chunk_data_size,
            ChunkSetRegion::End => self.end_chunk_data_size,
        }
    }

    /// The left (byte) boundary, within a single data slice's plaintext
    /// stream, of the given region.
    pub fn region_left_offset(&self, region: ChunkSetRegion) -> u64 {
        match region {
            ChunkSetRegion::Start => 0,
            ChunkSetRegion::Standard => self.start_chunk_data_size,
            ChunkSetRegion::End => {
                self.start_chunk_data_size
                    + self.standard_chunk_count_per_slice * self.standard_chunk_data_size
            }
        }
    }

    /// Byte offset, within a single slice *file* (header included), where
    /// the given chunk set's record begins.
    pub fn chunk_set_file_offset(&self, chunk_set_index: u64) -> u64 {
        let mut offset = FILE_HEADER_SIZE;
        if chunk_set_index == 0 {
            return offset;
        }
        offset += CHUNK_HEADER_SIZE + self.start_chunk_data_size;
        let standard_index = (chunk_set_index - 1).min(self.standard_chunk_count_per_slice);
        offset += standard_index * (CHUNK_HEADER_SIZE + self.standard_chunk_data_size);
        offset
    }

    /// Which chunk-set region (and chunk-set index within it) a byte offset
    /// into the plaintext data stream (per data slice) falls into.
    pub fn locate(&self, data_slice_offset: u64) -> (ChunkSetRegion, u64) {
        if data_slice_offset < self.start_chunk_data_size {
            return (ChunkSetRegion::Start, 0);
        }
        let after_start = data_slice_offset - self.start_chunk_data_size;
        if self.standard_chunk_data_size > 0 {
            let standard_index = after_start / self.standard_chunk_data_size;
            if standard_index < self.standard_chunk_count_per_slice {
                return (ChunkSetRegion::Standard, 1 + standard_index);
            }
        }
        (ChunkSetRegion::End, 1 + self.standard_chunk_count_per_slice)
    }

    /// Maps a whole-object byte offset to the chunk set that holds it and
    /// the position within that chunk set: `(region, chunk_set_index,
    /// slice_within_set, offset_in_chunk)`. The object's bytes are ordered
    /// chunk-set-major, slice-minor — data slice 0's chunk, then slice 1's,
    /// ... for chunk set 0, then chunk set 1, and so on (the order the
    /// Writer fills and the Reader walks in direct-read mode).
    pub fn locate_global(&self, global_offset: u64) -> (ChunkSetRegion, u64, usize, u64) {
        let d = self.data_slice_count as u64;
        let start_block = self.start_chunk_data_size * d;

        let (region, chunk_set_index, remainder) = if global_offset < start_block {
            (ChunkSetRegion::Start, 0, global_offset)
        } else {
            let after_start = global_offset - start_block;
            let standard_block = self.standard_chunk_data_size * d;
            if standard_block > 0 {
                let standard_index = after_start / standard_block;
                if standard_index < self.standard_chunk_count_per_slice {
                    (ChunkSetRegion::Standard, 1 + standard_index, after_start % standard_block)
                } else {
                    let consumed = self.standard_chunk_count_per_slice * standard_block;
                    (
                        ChunkSetRegion::End,
                        1 + self.standard_chunk_count_per_slice,
                        after_start - consumed,
                    )
                }
            } else {
                (ChunkSetRegion::End, 1 + self.standard_chunk_count_per_slice, after_start)
            }
        };

        let chunk_data_size = self.chunk_data_size(region);
        let (slice_within_set, offset_in_chunk) = if chunk_data_size > 0 {
            ((remainder / chunk_data_size) as usize, remainder % chunk_data_size)
        } else {
            (0, 0)
        };
        (region, chunk_set_index, slice_within_set, offset_in_chunk)
    }

    /// The whole-object byte offset at which `chunk_set_index` begins.
    pub fn chunk_set_global_offset(&self, chunk_set_index: u64) -> u64 {
        let d = self.data_slice_count as u64;
        if chunk_set_index == 0 {
            return 0;
        }
        let start_block = self.start_chunk_data_size * d;
        let standard_block = self.standard_chunk_data_size * d;
        let standard_index = (chunk_set_index - 1).min(self.standard_chunk_count_per_slice);
        start_block + standard_index * standard_block
    }
}
