// src/pending.rs
//
// Movement clips need post-roll: the event fires mid-motion, so the clip
// keeps recording for a while before it is handed to the encoder. Each open
// recording is a small state machine: Accumulating(frames_remaining) until
// the countdown hits zero, then Ready, then dispatched as a VideoTask and
// dropped from the index.

use crate::types::{EventMessage, VideoTask};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingState {
    Accumulating { frames_remaining: u32 },
    Ready,
}

pub struct PendingRecording<F> {
    state: RecordingState,
    /// Pre-roll snapshot plus accumulated post-roll frames, chronological.
    frames: Vec<(F, f64)>,
    filepath: PathBuf,
    frame_size: (i32, i32),
    fps: f64,
    event: EventMessage,
}

/// Index of all in-flight recordings, keyed by a generated id.
pub struct PendingRecordings<F> {
    recordings: HashMap<Uuid, PendingRecording<F>>,
}

impl<F: Clone> PendingRecordings<F> {
    pub fn new() -> Self {
        Self {
            recordings: HashMap::new(),
        }
    }

    /// Open a recording seeded with the pre-roll frames already captured.
    pub fn open(
        &mut self,
        pre_roll: Vec<(F, f64)>,
        post_roll_frames: u32,
        filepath: PathBuf,
        frame_size: (i32, i32),
        fps: f64,
        event: EventMessage,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let state = if post_roll_frames == 0 {
            RecordingState::Ready
        } else {
            RecordingState::Accumulating {
                frames_remaining: post_roll_frames,
            }
        };
        self.recordings.insert(
            id,
            PendingRecording {
                state,
                frames: pre_roll,
                filepath,
                frame_size,
                fps,
                event,
            },
        );
        id
    }

    /// Feed the current frame to every open recording and collect the ones
    /// whose post-roll just completed.
    pub fn advance(&mut self, frame: &F, timestamp: f64) -> Vec<VideoTask<F>> {
        for recording in self.recordings.values_mut() {
            if let RecordingState::Accumulating { frames_remaining } = recording.state {
                recording.frames.push((frame.clone(), timestamp));
                let left = frames_remaining - 1;
                recording.state = if left == 0 {
                    RecordingState::Ready
                } else {
                    RecordingState::Accumulating {
                        frames_remaining: left,
                    }
                };
            }
        }

        let ready_ids: Vec<Uuid> = self
            .recordings
            .iter()
            .filter(|(_, r)| r.state == RecordingState::Ready)
            .map(|(id, _)| *id)
            .collect();

        let mut tasks = Vec::with_capacity(ready_ids.len());
        for id in ready_ids {
            let Some(recording) = self.recordings.remove(&id) else {
                continue;
            };
            debug!(
                "Recording {} complete: {} frames for {}",
                id,
                recording.frames.len(),
                recording.filepath.display()
            );
            tasks.push(VideoTask {
                filepath: recording.filepath,
                frames: recording.frames,
                frame_size: recording.frame_size,
                fps: recording.fps,
                event: recording.event,
            });
        }
        tasks
    }

    pub fn open_count(&self) -> usize {
        self.recordings.len()
    }
}
