// src/motion.rs
//
// Per-vehicle temporal state for armed vehicles and the windowed rules that
// decide movement and disappearance. Pure data-in/data-out: the tracking
// loop feeds it detections and an alarm snapshot, it answers with what
// fired this frame.

use crate::types::{ActiveAlarmEntry, TrackedDetection};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Tunable thresholds, taken from `AlarmConfig`.
#[derive(Debug, Clone, Copy)]
pub struct MotionRules {
    /// Sliding window `W` in seconds.
    pub window_secs: f64,
    pub min_distance_px: f64,
    pub disappearance_secs: f64,
}

/// A movement that crossed the distance threshold within the window.
#[derive(Debug, Clone, Copy)]
pub struct MovementDetected {
    pub distance_px: f64,
    pub time_seconds: f64,
    pub start_pos: (f32, f32),
    pub end_pos: (f32, f32),
}

/// Everything that fired while evaluating one frame.
#[derive(Debug, Default)]
pub struct FrameVerdict {
    pub movements: Vec<(i64, ActiveAlarmEntry, MovementDetected)>,
    /// `(alarm_id, entry, seconds unseen)`.
    pub disappearances: Vec<(i64, ActiveAlarmEntry, f64)>,
    /// Track ids that were marked disappeared and showed up again.
    pub reappeared: Vec<i64>,
}

pub struct ArmedVehicleMonitor {
    rules: MotionRules,
    position_history: HashMap<i64, Vec<(f64, (f32, f32))>>,
    last_seen: HashMap<i64, f64>,
    disappearance_sent: HashSet<i64>,
}

impl ArmedVehicleMonitor {
    pub fn new(rules: MotionRules) -> Self {
        Self {
            rules,
            position_history: HashMap::new(),
            last_seen: HashMap::new(),
            disappearance_sent: HashSet::new(),
        }
    }

    /// Join this frame's detections against the active-alarm snapshot and
    /// apply both rules. `now` is the frame capture timestamp.
    pub fn evaluate_frame(
        &mut self,
        detections: &[TrackedDetection],
        alarms: &HashMap<i64, ActiveAlarmEntry>,
        now: f64,
    ) -> FrameVerdict {
        let mut verdict = FrameVerdict::default();
        let mut seen_tracks: HashSet<i64> = HashSet::new();

        for detection in detections {
            seen_tracks.insert(detection.track_id);

            let Some((alarm_id, entry)) = find_alarm(alarms, detection.track_id) else {
                continue;
            };

            if self.mark_seen(detection.track_id, now) {
                verdict.reappeared.push(detection.track_id);
            }

            if let Some(movement) = self.observe_position(detection.track_id, now, detection.bbox.center())
            {
                verdict.movements.push((alarm_id, entry, movement));
            }
        }

        for (&alarm_id, entry) in alarms {
            if seen_tracks.contains(&entry.track_id) {
                continue;
            }
            if let Some(elapsed) = self.observe_missing(entry.track_id, now) {
                verdict.disappearances.push((alarm_id, *entry, elapsed));
            }
        }

        verdict
    }

    /// Record that the vehicle is visible. Returns true when this clears a
    /// previously fired disappearance, i.e. the vehicle reappeared.
    fn mark_seen(&mut self, track_id: i64, now: f64) -> bool {
        self.last_seen.insert(track_id, now);
        self.disappearance_sent.remove(&track_id)
    }

    /// Append a position sample and apply the movement rule: once the
    /// pruned history spans at least 0.8·W, fire if the start-to-end
    /// displacement crosses the threshold, then collapse the history to the
    /// newest sample so sustained motion does not re-trigger every frame.
    fn observe_position(
        &mut self,
        track_id: i64,
        now: f64,
        position: (f32, f32),
    ) -> Option<MovementDetected> {
        let window = self.rules.window_secs;
        let history = self.position_history.entry(track_id).or_default();
        history.push((now, position));
        history.retain(|(ts, _)| now - ts <= window);

        if history.len() < 2 {
            return None;
        }

        let (start_ts, start_pos) = history[0];
        let (end_ts, end_pos) = history[history.len() - 1];
        if end_ts - start_ts < window * 0.8 {
            return None;
        }

        let distance = distance(start_pos, end_pos);
        if distance < self.rules.min_distance_px {
            return None;
        }

        *history = vec![(end_ts, end_pos)];
        Some(MovementDetected {
            distance_px: distance,
            time_seconds: end_ts - start_ts,
            start_pos,
            end_pos,
        })
    }

    /// The armed vehicle was not in this frame. Fires at most once per
    /// unseen episode; the marker is cleared only when it reappears.
    fn observe_missing(&mut self, track_id: i64, now: f64) -> Option<f64> {
        let last_seen = *self.last_seen.entry(track_id).or_insert(now);
        let elapsed = now - last_seen;
        if elapsed <= self.rules.disappearance_secs {
            return None;
        }
        if !self.disappearance_sent.insert(track_id) {
            return None;
        }
        debug!(
            "Track {} unseen for {:.1}s, disappearance fires",
            track_id, elapsed
        );
        Some(elapsed)
    }

    /// Drop the position history for a track (after its disappearance clip
    /// has been dispatched).
    pub fn clear_history(&mut self, track_id: i64) {
        self.position_history.remove(&track_id);
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f64 {
    let dx = (b.0 - a.0) as f64;
    let dy = (b.1 - a.1) as f64;
    dx.hypot(dy)
}

/// First active alarm armed on this track id, lowest alarm id wins when
/// several users armed the same vehicle.
fn find_alarm(
    alarms: &HashMap<i64, ActiveAlarmEntry>,
    track_id: i64,
) -> Option<(i64, ActiveAlarmEntry)> {
    alarms
        .iter()
        .filter(|(_, entry)| entry.track_id == track_id)
        .min_by_key(|(id, _)| **id)
        .map(|(id, entry)| (*id, *entry))
}
