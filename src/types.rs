// src/types.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Axis-aligned box in (post-resize) frame coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// One tracked object in one frame. The track id is only stable for as long
/// as the detector's internal tracking state lives.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedDetection {
    pub track_id: i64,
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BBox,
}

/// Mirror of a persisted active alarm, kept in the shared registry so the
/// tracking loop can match detections without touching storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveAlarmEntry {
    pub track_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Movement,
    Disappearance,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movement => "movement",
            Self::Disappearance => "disappearance",
        }
    }
}

/// Structured payload persisted as `details_json` on the alarm event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventDetails {
    Movement {
        distance_px: f64,
        time_seconds: f64,
        start_pos: [f32; 2],
        end_pos: [f32; 2],
    },
    Disappearance {
        time_seconds: f64,
    },
}

/// Raw detection emitted by the tracking loop, consumed by the event worker.
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub alarm_id: i64,
    pub user_id: i64,
    pub track_id: i64,
    /// Frame capture time, epoch seconds.
    pub timestamp: f64,
    pub details: EventDetails,
}

/// A finished clip assembly: ordered frames plus enough event identity for
/// the encoder to correlate the written file back to a persisted event.
#[derive(Debug, Clone)]
pub struct VideoTask<F> {
    pub filepath: PathBuf,
    /// `(frame, capture timestamp)` in chronological order.
    pub frames: Vec<(F, f64)>,
    /// `(width, height)` every frame is expected to match.
    pub frame_size: (i32, i32),
    pub fps: f64,
    pub event: EventMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_center() {
        let b = BBox {
            x1: 10.0,
            y1: 20.0,
            x2: 30.0,
            y2: 60.0,
        };
        assert_eq!(b.center(), (20.0, 40.0));
    }

    #[test]
    fn test_event_details_serialize_flat() {
        let details = EventDetails::Disappearance { time_seconds: 6.2 };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["time_seconds"], 6.2);
        assert!(json.get("type").is_none());
    }
}
