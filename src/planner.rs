//! Volume selection for a new object (spec §4.2): bucket writable volumes by
//! device group, round-robin across groups by free-space-descending order,
//! shuffle the chosen set, reserve space.

use crate::collaborators::VolumeFleet;
use crate::config::Config;
use crate::domain::VolumeId;
use crate::plan::Plan;
use crate::volume::Volume;
use rand::seq::SliceRandom;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("need {needed} writable volumes, only {available} available")]
    InsufficientVolumes { needed: usize, available: usize },
}

/// A planner-picked assignment of volumes to slice indices, plus the `Plan`
/// governing their layout.
pub struct Assignment {
    pub plan: Plan,
    pub data_volumes: Vec<Arc<Volume>>,
    pub parity_volumes: Vec<Arc<Volume>>,
}

impl Assignment {
    pub fn volume_for_slice(&self, slice_index: usize) -> &Arc<Volume> {
        if slice_index < self.data_volumes.len() {
            &self.data_volumes[slice_index]
        } else {
            &self.parity_volumes[slice_index - self.data_volumes.len()]
        }
    }

    pub fn data_volume_ids(&self) -> Vec<VolumeId> {
        self.data_volumes.iter().map(|v| v.id.clone()).collect()
    }

    pub fn parity_volume_ids(&self) -> Vec<VolumeId> {
        self.parity_volumes.iter().map(|v| v.id.clone()).collect()
    }
}

pub struct Planner<F: VolumeFleet> {
    fleet: Arc<F>,
    config: Config,
}

impl<F: VolumeFleet> Planner<F> {
    pub fn new(fleet: Arc<F>, config: Config) -> Self {
        Planner { fleet, config }
    }

    pub async fn plan(&self, file_size: u64) -> Result<Assignment, PlanError> {
        let needed = self.config.data_slice_count as usize + self.config.parity_slice_count as usize;
        let writable = self.fleet.get_writable_volumes().await;
        if writable.len() < needed {
            return Err(PlanError::InsufficientVolumes {
                needed,
                available: writable.len(),
            });
        }

        let mut picked = Self::order_candidates(writable, needed);
        picked.truncate(needed);
        picked.shuffle(&mut rand::rng());

        let plan = Plan::build(
            file_size,
            self.config.chunk_size,
            self.config.data_slice_count,
            self.config.parity_slice_count,
        );
        for volume in &picked {
            volume.reserve_space(plan.slice_size);
        }

        let data_volumes = picked[..self.config.data_slice_count as usize].to_vec();
        let parity_volumes = picked[self.config.data_slice_count as usize..].to_vec();

        Ok(Assignment {
            plan,
            data_volumes,
            parity_volumes,
        })
    }

    /// Bucket by device group, sort each bucket by `bytesFree - bytesPending`
    /// descending, round-robin flatten across buckets. Falls back to a
    /// single free-space-descending list if the round-robin can't produce
    /// `needed` entries (a bucket ran out early).
    fn order_candidates(writable: Vec<Arc<Volume>>, needed: usize) -> Vec<Arc<Volume>> {
        let mut groups: Vec<(String, Vec<Arc<Volume>>)> = Vec::new();
        for volume in writable.iter() {
            match groups.iter_mut().find(|(g, _)| *g == volume.device_group) {
                Some((_, bucket)) => bucket.push(volume.clone()),
                None => groups.push((volume.device_group.clone(), vec![volume.clone()])),
            }
        }
        for (_, bucket) in groups.iter_mut() {
            bucket.sort_by_key(|v| std::cmp::Reverse(free_score(v)));
        }

        let mut round_robin = Vec::with_capacity(writable.len());
        let max_len = groups.iter().map(|(_, b)| b.len()).max().unwrap_or(0);
        for i in 0..max_len {
            for (_, bucket) in groups.iter() {
                if let Some(v) = bucket.get(i) {
                    round_robin.push(v.clone());
                }
            }
        }

        if round_robin.len() >= needed {
            round_robin
        } else {
            let mut by_free_space = writable;
            by_free_space.sort_by_key(|v| std::cmp::Reverse(free_score(v)));
            by_free_space
        }
    }
}

fn free_score(volume: &Volume) -> i64 {
    volume.bytes_free() as i64 - volume.bytes_pending() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VolumeId;
    use async_trait::async_trait;

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
            self.0.clone()
        }
    }

    fn volume(id: &str, group: &str, bytes_total: u64) -> Arc<Volume> {
        Arc::new(Volume::new(
            VolumeId::new(id),
            uuid::Uuid::nil(),
            0,
            std::path::PathBuf::from("/tmp/does-not-matter"),
            group.to_string(),
            bytes_total,
        ))
    }

    #[tokio::test]
    async fn fails_when_not_enough_writable_volumes() {
        let fleet = Arc::new(FixedFleet(vec![volume("a", "usb0", 100)]));
        let mut config = Config::default();
        config.data_slice_count = 2;
        config.parity_slice_count = 1;
        let planner = Planner::new(fleet, config);

        let err = planner.plan(1000).await.unwrap_err();
        assert!(matches!(err, PlanError::InsufficientVolumes { needed: 3, available: 1 }));
    }

    #[tokio::test]
    async fn picks_across_distinct_device_groups_when_balanced() {
        let volumes = vec![
            volume("a", "usb0", 1_000_000),
            volume("b", "usb1", 1_000_000),
            volume("c", "ata0", 1_000_000),
        ];
        let fleet = Arc::new(FixedFleet(volumes));
        let mut config = Config::default();
        config.data_slice_count = 2;
        config.parity_slice_count = 1;
        let planner = Planner::new(fleet, config);

        let assignment = planner.plan(1000).await.unwrap();
        let mut groups: Vec<&str> = assignment
            .data_volumes
            .iter()
            .chain(assignment.parity_volumes.iter())
            .map(|v| v.device_group.as_str())
            .collect();
        groups.sort();
        groups.dedup();
        assert_eq!(groups.len(), 3);
    }

    #[tokio::test]
    async fn reserves_slice_size_on_every_picked_volume() {
        let volumes = vec![volume("a", "usb0", 1_000_000), volume("b", "usb0", 1_000_000)];
        let fleet = Arc::new(FixedFleet(volumes));
        let mut config = Config::default();
        config.data_slice_count = 1;
        config.parity_slice_count = 1;
        let planner = Planner::new(fleet, config);

        let assignment = planner.plan(1000).await.unwrap();
        for v in assignment.data_volumes.iter().chain(assignment.parity_volumes.iter()) {
            assert_eq!(v.bytes_pending(), assignment.plan.slice_size);
        }
    }
}
