//! On-disk slice format and per-slice lifecycle operations (spec §4.1, §4.5).
//!
//! A slice is one stripe column of one object, living as a single file on
//! one volume: a 48-byte header followed by a sequence of MD5-framed chunk
//! records. Chunk payload length is never stored per-chunk — it is implied
//! by the chunk set's position in the object's `Plan`.

use crate::checksum::compute_md5;
use crate::domain::{ObjectId, SliceIndex, VolumeId};
use crate::format::{
    from_le_bytes3, from_le_bytes5, to_le_bytes3, to_le_bytes5, CHUNK_HEADER_SIZE,
    FILE_HEADER_SIZE, SLICE_MAGIC, SLICE_VERSION,
};
use crate::plan::{ChunkSetRegion, Plan};
use crate::volume::Volume;
use binrw::{BinRead, BinWrite};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum SliceError {
    #[error("slice is busy with another operation")]
    Busy,
    #[error("slice index {0} is out of range for D+P={1}")]
    InvalidIndex(SliceIndex, u8),
    #[error("slice file header is invalid")]
    HeaderInvalid,
    #[error(
        "checksum mismatch for object {object_id} slice {slice_index} on volume {volume_id} at offset {cursor_offset}"
    )]
    Checksum {
        object_id: ObjectId,
        slice_index: SliceIndex,
        volume_id: VolumeId,
        cursor_offset: u64,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const _: () = assert!(matches!(SLICE_MAGIC, [0x01, 0xFB, 0x02, 0xFB]));

#[derive(Debug, BinRead, BinWrite, Clone, Copy)]
#[brw(little, magic = b"\x01\xFB\x02\xFB")]
struct SliceHeaderRaw {
    version: u8,
    header_length: u16,
    header_md5: [u8; 16],
    object_id: [u8; 12],
    file_size: [u8; 5],
    data_slice_count: u8,
    parity_slice_count: u8,
    slice_index: u8,
    chunk_size: [u8; 3],
    padding: [u8; 2],
}

impl SliceHeaderRaw {
    /// Bytes `[23..48)` — the part covered by `header_md5`.
    fn hashed_region(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(25);
        buf.extend_from_slice(&self.object_id);
        buf.extend_from_slice(&self.file_size);
        buf.push(self.data_slice_count);
        buf.push(self.parity_slice_count);
        buf.push(self.slice_index);
        buf.extend_from_slice(&self.chunk_size);
        buf.extend_from_slice(&self.padding);
        buf
    }
}

fn file_name(object_id: &ObjectId, slice_index: SliceIndex) -> String {
    format!("{}.{}", object_id.to_hex(), slice_index.as_u8())
}

enum Mode {
    Write(tokio::fs::File),
    Read(tokio::fs::File),
    Closed,
}

/// One stripe column of one object, on one volume.
pub struct Slice {
    volume: Arc<Volume>,
    object_id: ObjectId,
    slice_index: SliceIndex,
    data_slice_count: u8,
    parity_slice_count: u8,
    chunk_size: u32,
    mode: Mode,
    is_committed: bool,
    /// Bytes reserved on the volume for this slice (released at commit/abort).
    reservation: u64,
    /// Bytes actually written to the file (header + chunk records), credited
    /// to the volume's used-bytes counter at commit.
    bytes_written: u64,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SliceError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SliceError::Busy)?;
        Ok(BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Slice {
    pub fn file_name(&self) -> String {
        file_name(&self.object_id, self.slice_index)
    }

    pub fn slice_index(&self) -> SliceIndex {
        self.slice_index
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn is_committed(&self) -> bool {
        self.is_committed
    }

    fn byte_kind(&self) -> crate::volume::ByteKind {
        if self.slice_index.is_parity(self.data_slice_count) {
            crate::volume::ByteKind::Parity
        } else {
            crate::volume::ByteKind::Data
        }
    }

    /// `create()`: open a temp handle on `volume`, write the file header,
    /// reserve `reservation` bytes, and enter write mode.
    pub async fn create(
        volume: Arc<Volume>,
        object_id: ObjectId,
        slice_index: SliceIndex,
        data_slice_count: u8,
        parity_slice_count: u8,
        chunk_size: u32,
        file_size: u64,
        reservation: u64,
    ) -> Result<Slice, SliceError> {
        if slice_index.as_usize() >= (data_slice_count as usize + parity_slice_count as usize) {
            return Err(SliceError::InvalidIndex(
                slice_index,
                data_slice_count + parity_slice_count,
            ));
        }
        if !volume.is_writable() {
            return Err(SliceError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("volume {} is not writable", volume.id),
            )));
        }

        let mut raw = SliceHeaderRaw {
            version: SLICE_VERSION,
            header_length: FILE_HEADER_SIZE as u16,
            header_md5: [0u8; 16],
            object_id: *object_id.as_bytes(),
            file_size: to_le_bytes5(file_size),
            data_slice_count,
            parity_slice_count,
            slice_index: slice_index.as_u8(),
            chunk_size: to_le_bytes3(chunk_size),
            padding: [0u8; 2],
        };
        raw.header_md5 = compute_md5(&raw.hashed_region());

        let mut buf = Cursor::new(Vec::new());
        raw.write(&mut buf).map_err(|_| SliceError::HeaderInvalid)?;
        debug_assert_eq!(buf.get_ref().len() as u64, FILE_HEADER_SIZE);

        volume.reserve_space(reservation);
        let file_name = file_name(&object_id, slice_index);
        let mut fh = volume.create_temporary_fh(&file_name).await?;
        fh.write_all(buf.get_ref()).await?;

        Ok(Slice {
            volume,
            object_id,
            slice_index,
            data_slice_count,
            parity_slice_count,
            chunk_size,
            mode: Mode::Write(fh),
            is_committed: false,
            reservation,
            bytes_written: FILE_HEADER_SIZE,
            busy: AtomicBool::new(false),
        })
    }

    /// `writeChunk(buf)`: MD5-frame `payload` and append it.
    pub async fn write_chunk(&mut self, payload: &[u8]) -> Result<(), SliceError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        let fh = match &mut self.mode {
            Mode::Write(fh) => fh,
            _ => return Err(SliceError::HeaderInvalid),
        };
        let md5 = compute_md5(payload);
        fh.write_all(&md5).await?;
        fh.write_all(payload).await?;
        self.bytes_written += CHUNK_HEADER_SIZE + payload.len() as u64;
        Ok(())
    }

    /// `open()`: open the committed file and validate the header.
    pub async fn open(
        volume: Arc<Volume>,
        object_id: ObjectId,
        slice_index: SliceIndex,
        data_slice_count: u8,
        parity_slice_count: u8,
        chunk_size: u32,
    ) -> Result<Slice, SliceError> {
        if !volume.is_readable() {
            return Err(SliceError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("volume {} is not readable", volume.id),
            )));
        }
        let name = file_name(&object_id, slice_index);
        let mut fh = volume.open_committed_fh(&name).await?;

        let mut header_bytes = vec![0u8; FILE_HEADER_SIZE as usize];
        fh.read_exact(&mut header_bytes).await?;
        let mut cursor = Cursor::new(header_bytes);
        let raw = SliceHeaderRaw::read(&mut cursor).map_err(|_| SliceError::HeaderInvalid)?;

        let expected_md5 = compute_md5(&raw.hashed_region());
        let valid = raw.header_md5 == expected_md5
            && raw.object_id == *object_id.as_bytes()
            && raw.data_slice_count == data_slice_count
            && raw.parity_slice_count == parity_slice_count
            && raw.slice_index == slice_index.as_u8()
            && from_le_bytes3(raw.chunk_size) == chunk_size;
        if !valid {
            return Err(SliceError::HeaderInvalid);
        }

        Ok(Slice {
            volume,
            object_id,
            slice_index,
            data_slice_count,
            parity_slice_count,
            chunk_size,
            mode: Mode::Read(fh),
            is_committed: true,
            reservation: 0,
            bytes_written: from_le_bytes5(raw.file_size),
            busy: AtomicBool::new(false),
        })
    }

    /// `seekToHead()`.
    pub async fn seek_to_head(&mut self) -> Result<(), SliceError> {
        self.seek_to_file_offset(FILE_HEADER_SIZE).await
    }

    /// `seekToChunkIndex(i)` against a given `Plan`.
    pub async fn seek_to_chunk_set(&mut self, plan: &Plan, chunk_set_index: u64) -> Result<(), SliceError> {
        self.seek_to_file_offset(plan.chunk_set_file_offset(chunk_set_index))
            .await
    }

    async fn seek_to_file_offset(&mut self, offset: u64) -> Result<(), SliceError> {
        let fh = match &mut self.mode {
            Mode::Read(fh) => fh,
            Mode::Write(fh) => fh,
            Mode::Closed => return Err(SliceError::HeaderInvalid),
        };
        fh.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(())
    }

    /// `readChunk()`: read the next chunk record at the current cursor and
    /// verify its MD5.
    pub async fn read_chunk(&mut self, region: ChunkSetRegion, plan: &Plan) -> Result<Vec<u8>, SliceError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        let data_size = plan.chunk_data_size(region) as usize;
        let fh = match &mut self.mode {
            Mode::Read(fh) => fh,
            _ => return Err(SliceError::HeaderInvalid),
        };
        let cursor_offset = fh.stream_position().await?;

        let mut stored_md5 = [0u8; 16];
        fh.read_exact(&mut stored_md5).await?;
        let mut payload = vec![0u8; data_size];
        if data_size > 0 {
            fh.read_exact(&mut payload).await?;
        }

        let computed = compute_md5(&payload);
        if computed != stored_md5 {
            return Err(SliceError::Checksum {
                object_id: self.object_id,
                slice_index: self.slice_index,
                volume_id: self.volume.id.clone(),
                cursor_offset,
            });
        }
        Ok(payload)
    }

    /// `close()`: fsync+close write, or close read.
    pub async fn close(&mut self) -> Result<(), SliceError> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Write(mut fh) => {
                fh.sync_all().await?;
            }
            Mode::Read(_) | Mode::Closed => {}
        }
        Ok(())
    }

    /// `commit()`: rename temp→committed; credit the volume's byte counters.
    pub async fn commit(&mut self) -> Result<(), SliceError> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        if !matches!(self.mode, Mode::Closed) {
            return Err(SliceError::Busy);
        }
        self.volume.commit_temporary_file(&self.file_name()).await?;
        self.is_committed = true;
        self.volume
            .apply_committed_bytes(self.reservation, self.bytes_written, self.byte_kind());
        Ok(())
    }

    /// `markAsCommitted()` (used by Destroyer to force delete() onto the
    /// committed path without having gone through the write path itself).
    pub fn mark_as_committed(&mut self) {
        self.is_committed = true;
    }

    /// `delete()`: close if open, unlink, release whatever accounting this
    /// slice still owns.
    pub async fn delete(&mut self) -> Result<(), SliceError> {
        if !matches!(self.mode, Mode::Closed) {
            self.close().await.ok();
        }
        let name = self.file_name();
        if self.is_committed {
            self.volume.delete_committed_file(&name).await?;
            self.volume
                .release_committed_bytes(self.bytes_written, self.byte_kind());
        } else {
            self.volume.delete_temporary_file(&name).await?;
            self.volume.release_reservation(self.reservation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use crate::volume::DirectoryMounter;
    use uuid::Uuid;

    async fn test_volume() -> (tempfile::TempDir, Arc<Volume>) {
        let dir = tempfile::tempdir().unwrap();
        let volume = Arc::new(Volume::new(
            VolumeId::new("vol-a"),
            Uuid::nil(),
            0,
            dir.path().to_path_buf(),
            "usb0".to_string(),
            1_000_000,
        ));
        volume.start(&DirectoryMounter, [0u8; 16]).await.unwrap();
        (dir, volume)
    }

    #[tokio::test]
    async fn create_write_commit_then_open_and_read_back() {
        let (_dir, volume) = test_volume().await;
        let object_id = ObjectId::generate();
        let plan = Plan::build(12, 128, 2, 1);

        let mut slice = Slice::create(
            volume.clone(),
            object_id,
            SliceIndex::new(0),
            2,
            1,
            128,
            12,
            plan.slice_size,
        )
        .await
        .unwrap();

        slice.write_chunk(b"payload!").await.unwrap();
        slice.close().await.unwrap();
        slice.commit().await.unwrap();

        assert!(volume.committed_path(&slice.file_name()).is_file());
        assert_eq!(volume.bytes_used_data(), slice.bytes_written);

        let mut reopened = Slice::open(volume.clone(), object_id, SliceIndex::new(0), 2, 1, 128)
            .await
            .unwrap();
        reopened.seek_to_head().await.unwrap();
        let payload = reopened
            .read_chunk(ChunkSetRegion::Start, &Plan::build(12, 128, 2, 1))
            .await
            .unwrap();
        assert_eq!(&payload[..8], b"payload!");
    }

    #[tokio::test]
    async fn checksum_mismatch_is_detected() {
        let (_dir, volume) = test_volume().await;
        let object_id = ObjectId::generate();
        let plan = Plan::build(8, 128, 1, 0);

        let mut slice = Slice::create(volume.clone(), object_id, SliceIndex::new(0), 1, 0, 128, 8, plan.slice_size)
            .await
            .unwrap();
        slice.write_chunk(b"12345678").await.unwrap();
        slice.close().await.unwrap();
        slice.commit().await.unwrap();

        // Flip one byte inside the payload region of the committed file.
        let path = volume.committed_path(&slice.file_name());
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let payload_offset = (FILE_HEADER_SIZE + CHUNK_HEADER_SIZE) as usize;
        bytes[payload_offset] ^= 0xFF;
        tokio::fs::write(&path, bytes).await.unwrap();

        let mut reopened = Slice::open(volume.clone(), object_id, SliceIndex::new(0), 1, 0, 128)
            .await
            .unwrap();
        reopened.seek_to_head().await.unwrap();
        let err = reopened
            .read_chunk(ChunkSetRegion::Start, &plan)
            .await
            .unwrap_err();
        assert!(matches!(err, SliceError::Checksum { slice_index, .. } if slice_index == SliceIndex::new(0)));
    }

    #[tokio::test]
    async fn delete_before_commit_cleans_up_temp_and_reservation() {
        let (_dir, volume) = test_volume().await;
        let object_id = ObjectId::generate();
        let plan = Plan::build(8, 128, 1, 0);

        let mut slice = Slice::create(volume.clone(), object_id, SliceIndex::new(0), 1, 0, 128, 8, plan.slice_size)
            .await
            .unwrap();
        slice.write_chunk(b"12345678").await.unwrap();
        slice.delete().await.unwrap();

        assert!(!volume.temporary_path(&slice.file_name()).exists());
        assert_eq!(volume.bytes_pending(), 0);
    }
}
