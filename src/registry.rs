// src/registry.rs
//
// Process-wide shared state. Both registries are last-writer-wins and only
// expose whole-value snapshots, so readers never observe a partially
// updated map. One writer per field during normal operation: the alarm
// lifecycle owns the active-alarm set, the tracking loop owns the latest
// detections.

use crate::types::{ActiveAlarmEntry, TrackedDetection};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Active alarm registry: alarm id -> {track id, owning user}.
#[derive(Clone, Default)]
pub struct ActiveAlarms {
    inner: Arc<RwLock<HashMap<i64, ActiveAlarmEntry>>>,
}

impl ActiveAlarms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, alarm_id: i64, entry: ActiveAlarmEntry) {
        self.inner.write().unwrap().insert(alarm_id, entry);
    }

    /// Removes an entry, reporting whether it was present. Disappearance
    /// handling tolerates a missing entry (it may already be gone).
    pub fn remove(&self, alarm_id: i64) -> bool {
        self.inner.write().unwrap().remove(&alarm_id).is_some()
    }

    /// Whole-map copy taken once per frame by the tracking loop. Staleness
    /// is bounded by one frame.
    pub fn snapshot(&self) -> HashMap<i64, ActiveAlarmEntry> {
        self.inner.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The most recent frame's detections, for API-facing queries.
#[derive(Debug, Clone)]
pub struct DetectionSnapshot {
    pub detections: Vec<TrackedDetection>,
    /// Capture time of the frame the list came from, epoch seconds.
    pub timestamp: f64,
}

#[derive(Clone, Default)]
pub struct LatestDetections {
    inner: Arc<RwLock<Option<DetectionSnapshot>>>,
}

impl LatestDetections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite semantics: the registry always reflects exactly one frame.
    pub fn publish(&self, detections: Vec<TrackedDetection>, timestamp: f64) {
        *self.inner.write().unwrap() = Some(DetectionSnapshot {
            detections,
            timestamp,
        });
    }

    pub fn get(&self) -> Option<DetectionSnapshot> {
        self.inner.read().unwrap().clone()
    }
}
