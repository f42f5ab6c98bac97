//! Parallel slice deletion for a committed object (spec §4.6, §7): every
//! slice is marked committed and deleted concurrently; per-slice failures
//! are logged, never propagated — the metadata row is deleted regardless.

use crate::slice::Slice;

/// Forces every slice onto the committed-delete path and removes them all
/// concurrently. Never fails: individual slice delete errors are logged.
pub async fn destroy(slices: Vec<Slice>) {
    let tasks: Vec<_> = slices
        .into_iter()
        .map(|mut slice| {
            tokio::spawn(async move {
                slice.mark_as_committed();
                if let Err(err) = slice.delete().await {
                    log::warn!(
                        "failed to delete slice {} on volume {}: {err}",
                        slice.slice_index(),
                        slice.volume().id
                    );
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ObjectId, SliceIndex, VolumeId};
    use crate::volume::{DirectoryMounter, Volume};
    use std::sync::Arc;

    #[tokio::test]
    async fn destroy_removes_every_committed_slice_file() {
        let dir = tempfile::tempdir().unwrap();
        let object_id = ObjectId::generate();
        let mut slices = Vec::new();
        let mut volumes = Vec::new();

        for i in 0..3u8 {
            let volume = Arc::new(Volume::new(
                VolumeId::new(format!("vol-{i}")),
                uuid::Uuid::nil(),
                i,
                dir.path().join(format!("vol-{i}")),
                "usb0".to_string(),
                1_000_000,
            ));
            volume.start(&DirectoryMounter, [0u8; 16]).await.unwrap();
            let mut slice =
                Slice::create(volume.clone(), object_id, SliceIndex::new(i), 2, 1, 128, 8, 1000)
                    .await
                    .unwrap();
            slice.write_chunk(b"12345678").await.unwrap();
            slice.close().await.unwrap();
            slice.commit().await.unwrap();
            volumes.push(volume);
            slices.push(slice);
        }

        let paths: Vec<_> = slices
            .iter()
            .map(|s| s.volume().committed_path(&s.file_name()))
            .collect();
        for path in &paths {
            assert!(path.is_file());
        }

        destroy(slices).await;

        for path in &paths {
            assert!(!path.exists());
        }
        for volume in &volumes {
            assert_eq!(volume.bytes_used_data(), 0);
        }
    }
}
