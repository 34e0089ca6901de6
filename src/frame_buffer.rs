// src/frame_buffer.rs
//
// Rolling history of recent frames, owned by the tracking loop. A snapshot
// of this buffer becomes the pre-roll of every event clip. Generic over the
// frame type so the eviction and snapshot behaviour is testable without
// touching OpenCV.

use std::collections::VecDeque;

pub struct FrameRing<F> {
    frames: VecDeque<(F, f64)>,
    capacity: usize,
}

impl<F: Clone> FrameRing<F> {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame with its capture timestamp, evicting the oldest once
    /// the buffer is full.
    pub fn push(&mut self, frame: F, timestamp: f64) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back((frame, timestamp));
    }

    /// Chronological copy of the buffered history.
    pub fn snapshot(&self) -> Vec<(F, f64)> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
