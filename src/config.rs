// src/config.rs

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub detection: DetectionConfig,
    pub alarm: AlarmConfig,
    pub video: VideoConfig,
    pub notification: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// RTSP url or any capture source OpenCV understands.
    pub url: String,
    pub camera_fps: u32,
    /// Frames wider than this are downscaled before detection.
    pub target_detection_width: i32,
    /// Consecutive read failures tolerated before the long backoff kicks in.
    pub max_read_failures: u32,
    pub base_retry_delay_secs: u64,
    pub long_retry_delay_secs: u64,
    pub reopen_delay_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://127.0.0.1:8554/cam".to_string(),
            camera_fps: 25,
            target_detection_width: 1280,
            max_read_failures: 5,
            base_retry_delay_secs: 2,
            long_retry_delay_secs: 30,
            reopen_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model_path: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: "models/yolo11m.onnx".to_string(),
            confidence_threshold: 0.675,
            iou_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Sliding window `W` over which movement is judged, seconds.
    pub time_window_secs: f64,
    /// Minimum start-to-end displacement that counts as movement, pixels.
    pub min_distance_px: f64,
    /// How long an armed vehicle may stay unseen before it is gone, seconds.
    pub disappearance_secs: f64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            time_window_secs: 0.5,
            min_distance_px: 10.0,
            disappearance_secs: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub save_path: String,
    pub fps: u32,
    pub seconds_before_event: u32,
    pub seconds_after_event: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            save_path: "instance/event_videos".to_string(),
            fps: 10,
            seconds_before_event: 5,
            seconds_after_event: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub telegram_bot_token: Option<String>,
    pub cooldown_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Ring buffer capacity: pre-roll plus a two second margin so the event
    /// frame itself and a little slack are always covered.
    pub fn frame_buffer_capacity(&self) -> usize {
        (self.source.camera_fps * (self.video.seconds_before_event + 2)) as usize
    }

    /// Post-roll countdown for movement clips, in frames.
    pub fn post_roll_frames(&self) -> u32 {
        self.source.camera_fps * self.video.seconds_after_event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_expected_constants() {
        let config = Config::default();
        assert_eq!(config.alarm.time_window_secs, 0.5);
        assert_eq!(config.alarm.min_distance_px, 10.0);
        assert_eq!(config.alarm.disappearance_secs, 5.0);
        assert_eq!(config.frame_buffer_capacity(), 25 * 7);
        assert_eq!(config.post_roll_frames(), 25 * 15);
    }

    #[test]
    fn test_partial_yaml_falls_back_to_defaults() {
        let yaml = "source:\n  url: rtsp://cam.local/stream\nalarm:\n  disappearance_secs: 8.0\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.source.url, "rtsp://cam.local/stream");
        assert_eq!(config.alarm.disappearance_secs, 8.0);
        assert_eq!(config.alarm.min_distance_px, 10.0);
        assert_eq!(config.video.fps, 10);
    }
}
