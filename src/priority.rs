//! Per-volume "low priority waits for high" gate (spec §5). The VerifyJob
//! calls `wait_for_access` with `Priority::Low` before touching a volume so
//! it never starves foreground (`Priority::Normal`) I/O.

use crate::domain::VolumeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Low,
}

struct VolumeGate {
    high_count: AtomicUsize,
    drained: Notify,
}

impl VolumeGate {
    fn new() -> Self {
        VolumeGate {
            high_count: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }
}

/// Registry of per-volume priority gates, keyed by `VolumeId`.
#[derive(Default)]
pub struct VolumePriority {
    gates: Mutex<HashMap<VolumeId, std::sync::Arc<VolumeGate>>>,
}

impl VolumePriority {
    pub fn new() -> Self {
        VolumePriority {
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate_for(&self, volume_id: &VolumeId) -> std::sync::Arc<VolumeGate> {
        let mut gates = self.gates.lock().unwrap();
        gates
            .entry(volume_id.clone())
            .or_insert_with(|| std::sync::Arc::new(VolumeGate::new()))
            .clone()
    }

    /// Returns immediately for `Normal`, and for `Low` while `highCount`
    /// is zero; otherwise waits until the last `Normal` handle releases.
    pub async fn wait_for_access(&self, volume_id: &VolumeId, priority: Priority) {
        if priority == Priority::Normal {
            return;
        }
        loop {
            let gate = self.gate_for(volume_id);
            if gate.high_count.load(Ordering::Acquire) == 0 {
                return;
            }
            gate.drained.notified().await;
        }
    }

    /// `registerHandle(volumeId, Normal)`: increments the volume's
    /// `highCount`. Returns a guard whose drop releases it.
    pub fn register_handle(&self, volume_id: &VolumeId) -> HandleGuard {
        let gate = self.gate_for(volume_id);
        gate.high_count.fetch_add(1, Ordering::AcqRel);
        HandleGuard { gate }
    }
}

pub struct HandleGuard {
    gate: std::sync::Arc<VolumeGate>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.gate.high_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gate.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn normal_priority_never_blocks() {
        let priority = VolumePriority::new();
        let id = VolumeId::new("vol-a");
        let _guard = priority.register_handle(&id);
        priority.wait_for_access(&id, Priority::Normal).await;
    }

    #[tokio::test]
    async fn low_priority_waits_for_high_to_drain() {
        let priority = std::sync::Arc::new(VolumePriority::new());
        let id = VolumeId::new("vol-a");
        let guard = priority.register_handle(&id);

        let waiter_priority = priority.clone();
        let waiter_id = id.clone();
        let handle = tokio::spawn(async move {
            waiter_priority.wait_for_access(&waiter_id, Priority::Low).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(guard);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn low_priority_passes_through_when_no_high_handles() {
        let priority = VolumePriority::new();
        let id = VolumeId::new("vol-a");
        priority.wait_for_access(&id, Priority::Low).await;
    }
}
