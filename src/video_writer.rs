// src/video_writer.rs
//
// Drains clip tasks, encodes them with OpenCV and then tries to attach the
// file to the persisted alarm event. The attachment is best effort: the
// event row is matched by alarm, type and approximate timestamp, and a
// clip with no match simply stays unlinked.

use crate::storage::Storage;
use crate::types::{EventMessage, VideoTask};
use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio::VideoWriter,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How far a persisted event's timestamp may sit from the task's timestamp
/// and still be considered the clip's event.
const MATCH_TOLERANCE_SECS: i64 = 5;

pub struct VideoEncoder {
    rx: Receiver<VideoTask<Mat>>,
    storage: Arc<dyn Storage>,
    stop: Arc<AtomicBool>,
}

impl VideoEncoder {
    pub fn new(rx: Receiver<VideoTask<Mat>>, storage: Arc<dyn Storage>, stop: Arc<AtomicBool>) -> Self {
        Self { rx, storage, stop }
    }

    pub fn run(&self) {
        info!("Video encoder started");
        while !self.stop.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(Duration::from_secs(1)) {
                Ok(task) => self.handle(task),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Video channel disconnected");
                    break;
                }
            }
        }
        info!("Video encoder stopped");
    }

    fn handle(&self, task: VideoTask<Mat>) {
        if !task_is_complete(&task) {
            error!(
                "Incomplete video task for {}, skipping",
                task.filepath.display()
            );
            return;
        }

        info!(
            "Writing clip {}: {} frames, {:?} @ {} fps",
            task.filepath.display(),
            task.frames.len(),
            task.frame_size,
            task.fps
        );

        match write_clip(&task) {
            Ok(true) => {
                info!("Wrote clip {}", task.filepath.display());
                if let Err(e) = self.link_clip(&task.event, &task.filepath) {
                    error!(
                        "Failed to link clip {} to its event: {:#}",
                        task.filepath.display(),
                        e
                    );
                }
            }
            Ok(false) => {
                error!(
                    "Failed to open video writer for {}, skipping task",
                    task.filepath.display()
                );
            }
            Err(e) => {
                error!(
                    "Error while writing {}: {:#}. Removing partial file",
                    task.filepath.display(),
                    e
                );
                if task.filepath.exists() {
                    if let Err(e) = std::fs::remove_file(&task.filepath) {
                        error!(
                            "Could not remove partial clip {}: {}",
                            task.filepath.display(),
                            e
                        );
                    }
                }
            }
        }
    }

    /// Find the persisted event this clip belongs to and store the clip's
    /// file name on it. Ambiguity within the tolerance window resolves to
    /// the most recent row.
    fn link_clip(&self, event: &EventMessage, filepath: &Path) -> Result<()> {
        let around = Utc
            .timestamp_millis_opt((event.timestamp * 1000.0) as i64)
            .single()
            .unwrap_or_else(Utc::now);

        let found = self.storage.find_event_near(
            event.alarm_id,
            event.kind,
            around,
            ChronoDuration::seconds(MATCH_TOLERANCE_SECS),
        )?;

        let Some(stored) = found else {
            warn!(
                "No matching alarm event for clip {} (alarm {}, type {}, ts {:.0})",
                filepath.display(),
                event.alarm_id,
                event.kind.as_str(),
                event.timestamp
            );
            return Ok(());
        };

        let filename = filepath
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.storage.set_event_video_path(stored.id, filename)?;
        info!("Linked alarm event {} to clip {}", stored.id, filename);
        Ok(())
    }
}

/// A task must carry a path, frames, valid dimensions and a usable rate.
fn task_is_complete<F>(task: &VideoTask<F>) -> bool {
    !task.filepath.as_os_str().is_empty()
        && !task.frames.is_empty()
        && task.frame_size.0 > 0
        && task.frame_size.1 > 0
        && task.fps > 0.0
}

/// Encode every frame in order. Returns Ok(false) when the writer could
/// not be opened; any later failure propagates so the caller can clean up.
fn write_clip(task: &VideoTask<Mat>) -> Result<bool> {
    if let Some(parent) = task.filepath.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let Some(path) = task.filepath.to_str() else {
        bail!("clip path is not valid UTF-8");
    };
    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let size = Size::new(task.frame_size.0, task.frame_size.1);
    let mut writer = VideoWriter::new(path, fourcc, task.fps, size, true)?;
    if !writer.is_opened()? {
        return Ok(false);
    }

    let result = (|| -> Result<()> {
        for (frame, _) in &task.frames {
            if frame.cols() == size.width && frame.rows() == size.height {
                writer.write(frame)?;
            } else {
                let mut resized = Mat::default();
                imgproc::resize(frame, &mut resized, size, 0.0, 0.0, imgproc::INTER_AREA)?;
                writer.write(&resized)?;
            }
        }
        Ok(())
    })();

    writer.release()?;
    result.map(|_| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventDetails, EventKind};
    use std::path::PathBuf;

    fn task(frames: Vec<(u8, f64)>, filepath: &str, frame_size: (i32, i32), fps: f64) -> VideoTask<u8> {
        VideoTask {
            filepath: PathBuf::from(filepath),
            frames,
            frame_size,
            fps,
            event: EventMessage {
                kind: EventKind::Disappearance,
                alarm_id: 1,
                user_id: 2,
                track_id: 3,
                timestamp: 100.0,
                details: EventDetails::Disappearance { time_seconds: 6.0 },
            },
        }
    }

    #[test]
    fn test_link_clip_sets_video_path_within_tolerance() {
        use crate::storage::{MemoryStorage, NewAlarmEvent};

        let storage = Arc::new(MemoryStorage::new());
        let start = Utc.timestamp_opt(0, 0).unwrap();
        let alarm = storage.create_alarm(2, 3, start).unwrap();
        let event_id = storage
            .insert_event(NewAlarmEvent {
                alarm_id: alarm.id,
                event_type: EventKind::Disappearance,
                timestamp: Utc.timestamp_opt(102, 0).unwrap(),
                details_json: None,
            })
            .unwrap();

        let (_tx, rx) = crossbeam_channel::unbounded::<VideoTask<Mat>>();
        let storage_dyn: Arc<dyn Storage> = storage.clone();
        let encoder = VideoEncoder::new(rx, storage_dyn, Arc::new(AtomicBool::new(false)));

        let message = EventMessage {
            kind: EventKind::Disappearance,
            alarm_id: alarm.id,
            user_id: 2,
            track_id: 3,
            timestamp: 100.0,
            details: EventDetails::Disappearance { time_seconds: 6.0 },
        };
        encoder
            .link_clip(&message, Path::new("videos/disappearance_1_3_100.mp4"))
            .unwrap();

        let linked = storage
            .find_event_near(
                alarm.id,
                EventKind::Disappearance,
                Utc.timestamp_opt(102, 0).unwrap(),
                ChronoDuration::seconds(1),
            )
            .unwrap()
            .unwrap();
        assert_eq!(linked.id, event_id);
        assert_eq!(linked.video_path.as_deref(), Some("disappearance_1_3_100.mp4"));

        // Outside the tolerance window nothing is linked.
        let mut late = message.clone();
        late.timestamp = 200.0;
        encoder
            .link_clip(&late, Path::new("videos/disappearance_1_3_200.mp4"))
            .unwrap();
        let unchanged = storage
            .find_event_near(
                alarm.id,
                EventKind::Disappearance,
                Utc.timestamp_opt(102, 0).unwrap(),
                ChronoDuration::seconds(1),
            )
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.video_path.as_deref(), Some("disappearance_1_3_100.mp4"));
    }

    #[test]
    fn test_task_validation() {
        assert!(task_is_complete(&task(vec![(0, 0.0)], "a.mp4", (640, 480), 10.0)));
        assert!(!task_is_complete(&task(vec![], "a.mp4", (640, 480), 10.0)));
        assert!(!task_is_complete(&task(vec![(0, 0.0)], "", (640, 480), 10.0)));
        assert!(!task_is_complete(&task(vec![(0, 0.0)], "a.mp4", (0, 480), 10.0)));
        assert!(!task_is_complete(&task(vec![(0, 0.0)], "a.mp4", (640, 480), 0.0)));
    }
}
