// src/detector.rs
//
// Detection-and-tracking capability. The tracking loop only depends on the
// trait; the production implementation runs a YOLO ONNX model through ort
// and assigns stable track ids by IoU matching against the previous frames.

use crate::types::{BBox, TrackedDetection};
use anyhow::{bail, Result};
use opencv::{
    core::{self, Mat, Size},
    imgproc,
    prelude::*,
};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use std::collections::HashMap;
use tracing::{debug, info};

const YOLO_INPUT_SIZE: i32 = 640;
const YOLO_CLASSES: usize = 80;

// COCO ids the alarm system cares about.
const VEHICLE_CLASSES: [i64; 3] = [2, 3, 7]; // car, motorcycle, truck

pub trait VehicleDetector: Send {
    /// Detect and track vehicles in one (BGR) frame.
    fn detect(&mut self, frame: &Mat) -> Result<Vec<TrackedDetection>>;
}

#[derive(Debug, Clone)]
struct RawDetection {
    bbox: BBox,
    confidence: f32,
    class_id: i64,
}

pub struct YoloVehicleDetector {
    session: Session,
    tracker: IouTracker,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl YoloVehicleDetector {
    pub fn new(model_path: &str, confidence_threshold: f32, iou_threshold: f32) -> Result<Self> {
        info!("Loading YOLO model: {}", model_path);

        let session = Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().build()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)?;

        info!("YOLO detector initialized");
        Ok(Self {
            session,
            tracker: IouTracker::new(0.3, 90),
            confidence_threshold,
            iou_threshold,
        })
    }

    /// Letterbox the frame into the square model input and return the
    /// CHW-normalized tensor plus the transform back to frame coordinates.
    fn preprocess(&self, frame: &Mat) -> Result<(Vec<f32>, f32, f32, f32)> {
        let src_w = frame.cols();
        let src_h = frame.rows();
        if src_w == 0 || src_h == 0 {
            bail!("empty frame");
        }

        let scale = (YOLO_INPUT_SIZE as f32 / src_w as f32)
            .min(YOLO_INPUT_SIZE as f32 / src_h as f32);
        let scaled_w = (src_w as f32 * scale) as i32;
        let scaled_h = (src_h as f32 * scale) as i32;
        let pad_x = (YOLO_INPUT_SIZE - scaled_w) / 2;
        let pad_y = (YOLO_INPUT_SIZE - scaled_h) / 2;

        let mut rgb = Mat::default();
        imgproc::cvt_color(frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let mut resized = Mat::default();
        imgproc::resize(
            &rgb,
            &mut resized,
            Size::new(scaled_w, scaled_h),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut canvas = Mat::default();
        core::copy_make_border(
            &resized,
            &mut canvas,
            pad_y,
            YOLO_INPUT_SIZE - scaled_h - pad_y,
            pad_x,
            YOLO_INPUT_SIZE - scaled_w - pad_x,
            core::BORDER_CONSTANT,
            core::Scalar::all(114.0),
        )?;

        // HWC u8 -> CHW f32 in [0, 1]
        let size = YOLO_INPUT_SIZE as usize;
        let bytes = canvas.data_bytes()?;
        let mut input = vec![0.0f32; 3 * size * size];
        for c in 0..3 {
            for y in 0..size {
                for x in 0..size {
                    let hwc = (y * size + x) * 3 + c;
                    let chw = c * size * size + y * size + x;
                    input[chw] = bytes[hwc] as f32 / 255.0;
                }
            }
        }

        Ok((input, scale, pad_x as f32, pad_y as f32))
    }

    fn infer(&mut self, input: Vec<f32>) -> Result<Vec<f32>> {
        let shape = [1usize, 3, YOLO_INPUT_SIZE as usize, YOLO_INPUT_SIZE as usize];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }

    /// Parse the `[1, 4+classes, N]` prediction tensor, keep vehicle
    /// classes above the confidence threshold and undo the letterbox.
    fn postprocess(
        &self,
        output: &[f32],
        scale: f32,
        pad_x: f32,
        pad_y: f32,
    ) -> Vec<RawDetection> {
        let num_preds = output.len() / (4 + YOLO_CLASSES);
        let mut detections = Vec::new();

        for i in 0..num_preds {
            let cx = output[i];
            let cy = output[num_preds + i];
            let w = output[num_preds * 2 + i];
            let h = output[num_preds * 3 + i];

            let mut best_conf = 0.0f32;
            let mut best_class = 0usize;
            for c in 0..YOLO_CLASSES {
                let conf = output[num_preds * (4 + c) + i];
                if conf > best_conf {
                    best_conf = conf;
                    best_class = c;
                }
            }

            let class_id = best_class as i64;
            if best_conf < self.confidence_threshold || !VEHICLE_CLASSES.contains(&class_id) {
                continue;
            }

            detections.push(RawDetection {
                bbox: BBox {
                    x1: (cx - w / 2.0 - pad_x) / scale,
                    y1: (cy - h / 2.0 - pad_y) / scale,
                    x2: (cx + w / 2.0 - pad_x) / scale,
                    y2: (cy + h / 2.0 - pad_y) / scale,
                },
                confidence: best_conf,
                class_id,
            });
        }

        nms(detections, self.iou_threshold)
    }
}

impl VehicleDetector for YoloVehicleDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<TrackedDetection>> {
        let (input, scale, pad_x, pad_y) = self.preprocess(frame)?;
        let output = self.infer(input)?;
        let raw = self.postprocess(&output, scale, pad_x, pad_y);
        debug!("Detected {} vehicles", raw.len());
        Ok(self.tracker.assign(raw))
    }
}

pub fn class_name(class_id: i64) -> &'static str {
    match class_id {
        2 => "car",
        3 => "motorcycle",
        7 => "truck",
        _ => "unknown",
    }
}

fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawDetection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(&k.bbox, &det.bbox) < iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

struct Track {
    bbox: BBox,
    class_id: i64,
    last_seen_frame: u64,
}

/// Greedy IoU association. Ids are stable while the tracker's state lives;
/// a track unmatched for longer than the retention window is dropped and
/// its id never reused.
struct IouTracker {
    next_id: i64,
    tracks: HashMap<i64, Track>,
    iou_threshold: f32,
    retention_frames: u64,
    frame_count: u64,
}

impl IouTracker {
    fn new(iou_threshold: f32, retention_frames: u64) -> Self {
        Self {
            next_id: 0,
            tracks: HashMap::new(),
            iou_threshold,
            retention_frames,
            frame_count: 0,
        }
    }

    fn assign(&mut self, detections: Vec<RawDetection>) -> Vec<TrackedDetection> {
        self.frame_count += 1;
        let mut out = Vec::with_capacity(detections.len());
        let mut claimed: Vec<i64> = Vec::new();

        for det in detections {
            let best = self
                .tracks
                .iter()
                .filter(|(id, track)| {
                    track.class_id == det.class_id && !claimed.contains(id)
                })
                .map(|(id, track)| (*id, iou(&track.bbox, &det.bbox)))
                .filter(|(_, overlap)| *overlap > self.iou_threshold)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            let track_id = match best {
                Some((id, _)) => {
                    if let Some(track) = self.tracks.get_mut(&id) {
                        track.bbox = det.bbox;
                        track.last_seen_frame = self.frame_count;
                    }
                    id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.insert(
                        id,
                        Track {
                            bbox: det.bbox,
                            class_id: det.class_id,
                            last_seen_frame: self.frame_count,
                        },
                    );
                    debug!("New track #{} ({})", id, class_name(det.class_id));
                    id
                }
            };
            claimed.push(track_id);

            out.push(TrackedDetection {
                track_id,
                class_id: det.class_id,
                class_name: class_name(det.class_id).to_string(),
                confidence: det.confidence,
                bbox: det.bbox,
            });
        }

        let horizon = self.frame_count.saturating_sub(self.retention_frames);
        self.tracks.retain(|_, t| t.last_seen_frame > horizon);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(x: f32, class_id: i64, confidence: f32) -> RawDetection {
        RawDetection {
            bbox: BBox {
                x1: x,
                y1: 0.0,
                x2: x + 100.0,
                y2: 100.0,
            },
            confidence,
            class_id,
        }
    }

    #[test]
    fn test_tracker_keeps_id_across_frames() {
        let mut tracker = IouTracker::new(0.3, 90);

        let first = tracker.assign(vec![raw(0.0, 2, 0.9)]);
        let id = first[0].track_id;

        // Small shift, large overlap: same track.
        let second = tracker.assign(vec![raw(10.0, 2, 0.85)]);
        assert_eq!(second[0].track_id, id);

        // Far away: a new vehicle.
        let third = tracker.assign(vec![raw(500.0, 2, 0.9)]);
        assert_ne!(third[0].track_id, id);
    }

    #[test]
    fn test_tracker_separates_classes() {
        let mut tracker = IouTracker::new(0.3, 90);
        let first = tracker.assign(vec![raw(0.0, 2, 0.9)]);
        // Same place, different class: must not steal the car's id.
        let second = tracker.assign(vec![raw(0.0, 7, 0.9)]);
        assert_ne!(second[0].track_id, first[0].track_id);
    }

    #[test]
    fn test_tracker_drops_stale_tracks() {
        let mut tracker = IouTracker::new(0.3, 2);
        let first = tracker.assign(vec![raw(0.0, 2, 0.9)]);
        let id = first[0].track_id;

        tracker.assign(vec![]);
        tracker.assign(vec![]);
        tracker.assign(vec![]);

        // The old track aged out; the same spot gets a fresh id.
        let next = tracker.assign(vec![raw(0.0, 2, 0.9)]);
        assert_ne!(next[0].track_id, id);
    }

    #[test]
    fn test_nms_suppresses_overlapping_boxes() {
        let kept = nms(vec![raw(0.0, 2, 0.9), raw(5.0, 2, 0.7), raw(300.0, 2, 0.8)], 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = BBox {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
        };
        let b = BBox {
            x1: 20.0,
            y1: 20.0,
            x2: 30.0,
            y2: 30.0,
        };
        assert_eq!(iou(&a, &b), 0.0);
    }
}
