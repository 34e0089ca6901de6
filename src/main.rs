// src/main.rs

mod config;
mod detector;
mod event_consumer;
mod frame_buffer;
mod motion;
mod notifier;
mod pending;
mod registry;
mod storage;
mod tracking;
mod types;
mod video_writer;

use anyhow::Result;
use config::Config;
use detector::YoloVehicleDetector;
use event_consumer::{EventConsumer, EventProcessor};
use notifier::{DisabledNotifier, Notifier, TelegramNotifier};
use registry::{ActiveAlarms, LatestDetections};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use storage::{MemoryStorage, Storage};
use tracing::{error, info, warn};
use tracking::TrackingLoop;
use video_writer::VideoEncoder;

/// How long the orchestrator waits for workers to wind down before giving
/// up on them. At most one in-flight unit of work per worker is lost.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "vehicle_sentry={},ort=warn",
            config.logging.level
        ))
        .init();

    info!("Vehicle Sentry starting (config: {})", config_path);

    std::fs::create_dir_all(&config.video.save_path)?;

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let notifier: Arc<dyn Notifier> = match config.notification.telegram_bot_token.clone() {
        Some(token) => Arc::new(TelegramNotifier::new(token)),
        None => {
            warn!("No Telegram bot token configured, notifications disabled");
            Arc::new(DisabledNotifier)
        }
    };

    let active_alarms = ActiveAlarms::new();
    let latest_detections = LatestDetections::new();
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let (video_tx, video_rx) = crossbeam_channel::unbounded();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("Stop requested");
            stop.store(true, Ordering::Relaxed);
        })?;
    }

    let detector = YoloVehicleDetector::new(
        &config.detection.model_path,
        config.detection.confidence_threshold,
        config.detection.iou_threshold,
    )?;
    info!("Detector ready");

    let mut workers: Vec<(&str, JoinHandle<()>)> = Vec::new();

    {
        let mut tracking = TrackingLoop::new(
            config.clone(),
            Box::new(detector),
            active_alarms.clone(),
            latest_detections.clone(),
            event_tx,
            video_tx,
            stop.clone(),
        );
        workers.push((
            "tracking",
            std::thread::Builder::new()
                .name("tracking".to_string())
                .spawn(move || tracking.run())?,
        ));
    }

    {
        let processor = EventProcessor::new(
            storage.clone(),
            notifier,
            active_alarms.clone(),
            config.notification.cooldown_secs,
        );
        let consumer = EventConsumer::new(processor, event_rx, stop.clone());
        workers.push((
            "events",
            std::thread::Builder::new()
                .name("events".to_string())
                .spawn(move || consumer.run())?,
        ));
    }

    {
        let encoder = VideoEncoder::new(video_rx, storage.clone(), stop.clone());
        workers.push((
            "video",
            std::thread::Builder::new()
                .name("video".to_string())
                .spawn(move || encoder.run())?,
        ));
    }

    info!("All workers running");

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(500));
    }

    info!("Shutting down...");
    join_with_timeout(workers, SHUTDOWN_TIMEOUT);
    info!("Vehicle Sentry stopped");
    Ok(())
}

/// Cooperative shutdown with a deadline: workers finish their current unit
/// of work; any that miss the deadline are abandoned to process exit.
fn join_with_timeout(workers: Vec<(&str, JoinHandle<()>)>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for (name, handle) in workers {
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("Worker '{}' panicked", name);
            }
        } else {
            warn!("Worker '{}' did not stop in time, abandoning it", name);
        }
    }
}
