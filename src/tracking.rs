// src/tracking.rs
//
// The frame loop: pull a frame, detect, evaluate alarm rules, emit events
// and clip tasks. Nothing downstream may stall it — channel sends are
// non-blocking and every failure inside one iteration is logged and
// survived.

use crate::config::Config;
use crate::detector::VehicleDetector;
use crate::frame_buffer::FrameRing;
use crate::motion::{ArmedVehicleMonitor, MotionRules, MovementDetected};
use crate::pending::PendingRecordings;
use crate::registry::{ActiveAlarms, LatestDetections};
use crate::types::{EventDetails, EventKind, EventMessage, VideoTask};
use anyhow::Result;
use crossbeam_channel::Sender;
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

pub struct TrackingLoop {
    config: Config,
    detector: Box<dyn VehicleDetector>,
    active_alarms: ActiveAlarms,
    latest_detections: LatestDetections,
    event_tx: Sender<EventMessage>,
    video_tx: Sender<VideoTask<Mat>>,
    stop: Arc<AtomicBool>,

    capture: Option<VideoCapture>,
    read_failures: u32,
    ring: FrameRing<Mat>,
    pending: PendingRecordings<Mat>,
    monitor: ArmedVehicleMonitor,
}

impl TrackingLoop {
    pub fn new(
        config: Config,
        detector: Box<dyn VehicleDetector>,
        active_alarms: ActiveAlarms,
        latest_detections: LatestDetections,
        event_tx: Sender<EventMessage>,
        video_tx: Sender<VideoTask<Mat>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let ring = FrameRing::new(config.frame_buffer_capacity());
        let monitor = ArmedVehicleMonitor::new(MotionRules {
            window_secs: config.alarm.time_window_secs,
            min_distance_px: config.alarm.min_distance_px,
            disappearance_secs: config.alarm.disappearance_secs,
        });
        Self {
            config,
            detector,
            active_alarms,
            latest_detections,
            event_tx,
            video_tx,
            stop,
            capture: None,
            read_failures: 0,
            ring,
            pending: PendingRecordings::new(),
            monitor,
        }
    }

    pub fn run(&mut self) {
        info!(
            "Tracking loop started, source: {}",
            self.config.source.url
        );
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.iterate() {
                error!("Error in tracking loop iteration: {:#}", e);
                self.pause(Duration::from_secs(5));
            }
        }
        self.capture = None;
        info!("Tracking loop stopped");
    }

    fn iterate(&mut self) -> Result<()> {
        if self.capture.is_none() {
            let url = self.config.source.url.clone();
            info!("Opening video capture for {}...", url);
            let capture = VideoCapture::from_file(&url, videoio::CAP_ANY)?;
            if !capture.is_opened()? {
                warn!("Failed to open video capture, retrying...");
                self.pause(Duration::from_secs(self.config.source.reopen_delay_secs));
                return Ok(());
            }
            info!("Video capture opened");
            self.capture = Some(capture);
            self.read_failures = 0;
        }

        let mut frame = Mat::default();
        let ok = match self.capture.as_mut() {
            Some(capture) => capture.read(&mut frame).unwrap_or(false),
            None => false,
        };
        if !ok || frame.empty() {
            self.handle_read_failure();
            return Ok(());
        }
        self.read_failures = 0;

        let timestamp = epoch_secs();
        let frame = self.downscale(frame)?;
        self.process_frame(frame, timestamp)
    }

    fn process_frame(&mut self, frame: Mat, timestamp: f64) -> Result<()> {
        self.ring.push(frame.clone(), timestamp);

        let detections = self.detector.detect(&frame)?;
        let alarms = self.active_alarms.snapshot();
        self.latest_detections.publish(detections.clone(), timestamp);

        let verdict = self.monitor.evaluate_frame(&detections, &alarms, timestamp);

        for track_id in &verdict.reappeared {
            info!("Vehicle track {} reappeared", track_id);
        }

        let frame_size = (frame.cols(), frame.rows());
        let fps = self.config.video.fps as f64;

        for (alarm_id, entry, movement) in verdict.movements {
            info!(
                "[EVENT] Track {} (alarm {}) MOVED: {:.0}px in {:.2}s",
                entry.track_id, alarm_id, movement.distance_px, movement.time_seconds
            );
            let event = movement_event(alarm_id, entry.user_id, entry.track_id, timestamp, movement);
            self.emit_event(event.clone());

            let filepath = clip_path(
                &self.config.video.save_path,
                EventKind::Movement,
                alarm_id,
                entry.track_id,
                timestamp,
            );
            self.pending.open(
                self.ring.snapshot(),
                self.config.post_roll_frames(),
                filepath,
                frame_size,
                fps,
                event,
            );
        }

        for (alarm_id, entry, elapsed) in verdict.disappearances {
            info!(
                "[EVENT] Track {} (alarm {}) disappeared, not seen for {:.0}s",
                entry.track_id, alarm_id, elapsed
            );
            let event = EventMessage {
                kind: EventKind::Disappearance,
                alarm_id,
                user_id: entry.user_id,
                track_id: entry.track_id,
                timestamp,
                details: EventDetails::Disappearance {
                    time_seconds: round2(elapsed),
                },
            };
            self.emit_event(event.clone());
            self.monitor.clear_history(entry.track_id);

            // The vehicle is already gone, so there is no post-roll to wait
            // for: the buffered history becomes the clip as-is.
            let frames = self.ring.snapshot();
            if !frames.is_empty() {
                let filepath = clip_path(
                    &self.config.video.save_path,
                    EventKind::Disappearance,
                    alarm_id,
                    entry.track_id,
                    timestamp,
                );
                self.emit_video(VideoTask {
                    filepath,
                    frames,
                    frame_size,
                    fps,
                    event,
                });
            }
        }

        for task in self.pending.advance(&frame, timestamp) {
            self.emit_video(task);
        }

        Ok(())
    }

    fn emit_event(&self, event: EventMessage) {
        if self.event_tx.send(event).is_err() {
            warn!("Event channel closed, event dropped");
        }
    }

    fn emit_video(&self, task: VideoTask<Mat>) {
        info!(
            "Queued clip task: {} ({} frames)",
            task.filepath.display(),
            task.frames.len()
        );
        if self.video_tx.send(task).is_err() {
            warn!("Video channel closed, clip task dropped");
        }
    }

    /// Shrink frames wider than the detection width, preserving aspect.
    fn downscale(&self, frame: Mat) -> Result<Mat> {
        let target_width = self.config.source.target_detection_width;
        if frame.cols() <= target_width {
            return Ok(frame);
        }
        let ratio = target_width as f64 / frame.cols() as f64;
        let target_height = (frame.rows() as f64 * ratio) as i32;
        let mut resized = Mat::default();
        imgproc::resize(
            &frame,
            &mut resized,
            Size::new(target_width, target_height),
            0.0,
            0.0,
            imgproc::INTER_AREA,
        )?;
        Ok(resized)
    }

    fn handle_read_failure(&mut self) {
        self.read_failures += 1;
        warn!(
            "Failed to read frame from source, attempt {}/{}",
            self.read_failures, self.config.source.max_read_failures
        );
        self.capture = None;

        let (delay, reset) = read_backoff(
            self.read_failures,
            self.config.source.max_read_failures,
            self.config.source.base_retry_delay_secs,
            self.config.source.long_retry_delay_secs,
        );
        if reset {
            error!(
                "Max read failures reached, backing off for {:?}",
                delay
            );
            self.read_failures = 0;
        }
        self.pause(delay);
    }

    /// Sleep in short slices so a stop request is not held up by a backoff.
    fn pause(&self, total: Duration) {
        let slice = Duration::from_millis(250);
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.stop.load(Ordering::Relaxed) {
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}

/// Below the failure threshold the delay grows linearly; at the threshold
/// the loop takes one long pause and starts counting again.
fn read_backoff(failures: u32, max_failures: u32, base_secs: u64, long_secs: u64) -> (Duration, bool) {
    if failures >= max_failures {
        (Duration::from_secs(long_secs), true)
    } else {
        (Duration::from_secs(base_secs * failures as u64), false)
    }
}

fn movement_event(
    alarm_id: i64,
    user_id: i64,
    track_id: i64,
    timestamp: f64,
    movement: MovementDetected,
) -> EventMessage {
    EventMessage {
        kind: EventKind::Movement,
        alarm_id,
        user_id,
        track_id,
        timestamp,
        details: EventDetails::Movement {
            distance_px: round2(movement.distance_px),
            time_seconds: round2(movement.time_seconds),
            start_pos: [movement.start_pos.0, movement.start_pos.1],
            end_pos: [movement.end_pos.0, movement.end_pos.1],
        },
    }
}

/// Deterministic clip name: kind, alarm, track and event epoch second.
fn clip_path(save_path: &str, kind: EventKind, alarm_id: i64, track_id: i64, timestamp: f64) -> PathBuf {
    Path::new(save_path).join(format!(
        "{}_{}_{}_{}.mp4",
        kind.as_str(),
        alarm_id,
        track_id,
        timestamp as i64
    ))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_path_is_deterministic() {
        let path = clip_path("instance/event_videos", EventKind::Movement, 12, 7, 1700000000.9);
        assert_eq!(
            path,
            PathBuf::from("instance/event_videos/movement_12_7_1700000000.mp4")
        );
    }

    #[test]
    fn test_read_backoff_grows_linearly_then_goes_long() {
        assert_eq!(read_backoff(1, 5, 2, 30), (Duration::from_secs(2), false));
        assert_eq!(read_backoff(4, 5, 2, 30), (Duration::from_secs(8), false));
        assert_eq!(read_backoff(5, 5, 2, 30), (Duration::from_secs(30), true));
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(50.00001), 50.0);
        assert_eq!(round2(0.456), 0.46);
    }
}
