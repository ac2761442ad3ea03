//! Periodic sweep of expired workflow tombstones, modeled on the teacher's
//! `retention::spawn_retention_task` background-task shape.

use crate::room_registry::RoomRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SWEEP_INTERVAL_SECS: u64 = 30;

pub fn spawn_tombstone_sweep(registry: Arc<RoomRegistry>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(SWEEP_INTERVAL_SECS)).await;
            let removed = registry.sweep_tombstones();
            if removed > 0 {
                debug!(removed, "swept expired workflow tombstones");
            }
        }
    });
}
