// src/event_consumer.rs
//
// Turns raw detections into persisted alarm events and throttled
// notifications. Every message is one unit of work: a failure rolls that
// unit back (logged) and the worker moves on to the next message.

use crate::notifier::Notifier;
use crate::registry::ActiveAlarms;
use crate::storage::{Alarm, NewAlarmEvent, Storage, User};
use crate::types::{EventDetails, EventKind, EventMessage};
use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Event handling without the channel plumbing, so the rules are testable
/// with a clock under control.
pub struct EventProcessor {
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    active_alarms: ActiveAlarms,
    notification_cooldown: Duration,
}

impl EventProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        active_alarms: ActiveAlarms,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            storage,
            notifier,
            active_alarms,
            notification_cooldown: Duration::seconds(cooldown_secs as i64),
        }
    }

    pub fn handle_event(&self, event: &EventMessage, now: DateTime<Utc>) -> Result<()> {
        if event.alarm_id <= 0 || event.user_id <= 0 {
            warn!("Received incomplete event data, dropping: {:?}", event);
            return Ok(());
        }

        let Some(alarm) = self.storage.get_alarm(event.alarm_id)? else {
            warn!(
                "Alarm {} not found for {} event, dropping",
                event.alarm_id,
                event.kind.as_str()
            );
            return Ok(());
        };

        // The shared registry can lag the database; never act on an event
        // whose claimed owner does not match the stored alarm.
        if alarm.user_id != event.user_id {
            warn!(
                "User mismatch for alarm {}: event claims {}, owner is {}. Dropping",
                alarm.id, event.user_id, alarm.user_id
            );
            return Ok(());
        }

        // A disappearance may arrive after its alarm was already shut off;
        // it is still worth recording. Anything else against an inactive
        // alarm is stale.
        if !alarm.is_active && event.kind != EventKind::Disappearance {
            info!(
                "Alarm {} is inactive, dropping {} event",
                alarm.id,
                event.kind.as_str()
            );
            return Ok(());
        }

        let event_id = self.storage.insert_event(NewAlarmEvent {
            alarm_id: alarm.id,
            event_type: event.kind,
            timestamp: epoch_to_datetime(event.timestamp),
            details_json: Some(serde_json::to_string(&event.details)?),
        })?;
        info!(
            "Persisted {} event {} for alarm {}",
            event.kind.as_str(),
            event_id,
            alarm.id
        );

        if event.kind == EventKind::Disappearance {
            if alarm.is_active {
                self.storage.deactivate_alarm(alarm.id, now)?;
                info!("Deactivated alarm {} after disappearance", alarm.id);
            }
            if !self.active_alarms.remove(alarm.id) {
                warn!(
                    "Alarm {} was already absent from the active registry",
                    alarm.id
                );
            }
        }

        self.maybe_notify(event, &alarm, now)?;
        Ok(())
    }

    fn maybe_notify(&self, event: &EventMessage, alarm: &Alarm, now: DateTime<Utc>) -> Result<()> {
        let Some(user) = self.storage.get_user(alarm.user_id)? else {
            warn!("User {} for alarm {} not found", alarm.user_id, alarm.id);
            return Ok(());
        };
        let Some(chat_id) = user.chat_id.clone() else {
            info!("User {} has no linked chat, skipping notification", user.id);
            return Ok(());
        };

        let message = match event.kind {
            EventKind::Movement => {
                if !user.notify_movement {
                    info!("User {} disabled movement notifications", user.id);
                    return Ok(());
                }
                if let Some(last) = alarm.last_notification_at {
                    if now - last < self.notification_cooldown {
                        info!(
                            "Movement notification for alarm {} throttled by cooldown",
                            alarm.id
                        );
                        return Ok(());
                    }
                }
                movement_message(event, &user)
            }
            EventKind::Disappearance => {
                if !user.notify_disappearance {
                    info!("User {} disabled disappearance notifications", user.id);
                    return Ok(());
                }
                disappearance_message(event, &user)
            }
        };

        if self.notifier.send(&chat_id, &message) {
            self.storage.set_last_notification(alarm.id, now)?;
        } else {
            error!("Unable to deliver notification for alarm {}", alarm.id);
        }
        Ok(())
    }
}

fn movement_message(event: &EventMessage, _user: &User) -> String {
    let (distance_px, time_seconds) = match event.details {
        EventDetails::Movement {
            distance_px,
            time_seconds,
            ..
        } => (distance_px, time_seconds),
        _ => (0.0, 0.0),
    };
    format!(
        "MOVEMENT DETECTED\nVehicle (track {}, alarm {}) started moving.\nDisplacement: {}px in {}s.",
        event.track_id, event.alarm_id, distance_px, time_seconds
    )
}

fn disappearance_message(event: &EventMessage, _user: &User) -> String {
    let time_seconds = match event.details {
        EventDetails::Disappearance { time_seconds } => time_seconds,
        _ => 0.0,
    };
    format!(
        "VEHICLE MISSING\nVehicle (track {}, alarm {}) is out of sight.\nNot seen for {}s.",
        event.track_id, event.alarm_id, time_seconds
    )
}

fn epoch_to_datetime(epoch_secs: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt((epoch_secs * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Channel-draining worker around the processor.
pub struct EventConsumer {
    processor: EventProcessor,
    rx: Receiver<EventMessage>,
    stop: Arc<AtomicBool>,
}

impl EventConsumer {
    pub fn new(processor: EventProcessor, rx: Receiver<EventMessage>, stop: Arc<AtomicBool>) -> Self {
        Self {
            processor,
            rx,
            stop,
        }
    }

    pub fn run(&self) {
        info!("Event consumer started");
        while !self.stop.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(std::time::Duration::from_secs(1)) {
                Ok(event) => {
                    if let Err(e) = self.processor.handle_event(&event, Utc::now()) {
                        error!("Error processing event, unit of work abandoned: {:#}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Event channel disconnected");
                    break;
                }
            }
        }
        info!("Event consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::ActiveAlarmEntry;
    use std::sync::Mutex;

    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
        succeed: bool,
    }

    impl RecordingNotifier {
        fn new(succeed: bool) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                succeed,
            }
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, chat_id: &str, text: &str) -> bool {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            self.succeed
        }
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        notifier: Arc<RecordingNotifier>,
        alarms: ActiveAlarms,
        processor: EventProcessor,
        alarm_id: i64,
    }

    fn fixture(send_succeeds: bool) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        storage.add_user(User {
            id: 42,
            username: "owner".to_string(),
            chat_id: Some("chat-42".to_string()),
            notify_movement: true,
            notify_disappearance: true,
        });
        let alarm = storage.create_alarm(42, 7, at(0)).unwrap();

        let alarms = ActiveAlarms::new();
        alarms.insert(
            alarm.id,
            ActiveAlarmEntry {
                track_id: 7,
                user_id: 42,
            },
        );

        let notifier = Arc::new(RecordingNotifier::new(send_succeeds));
        let storage_dyn: Arc<dyn Storage> = storage.clone();
        let notifier_dyn: Arc<dyn Notifier> = notifier.clone();
        let processor = EventProcessor::new(storage_dyn, notifier_dyn, alarms.clone(), 60);
        Fixture {
            storage,
            notifier,
            alarms,
            processor,
            alarm_id: alarm.id,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn movement(alarm_id: i64, ts: f64) -> EventMessage {
        EventMessage {
            kind: EventKind::Movement,
            alarm_id,
            user_id: 42,
            track_id: 7,
            timestamp: ts,
            details: EventDetails::Movement {
                distance_px: 50.0,
                time_seconds: 0.45,
                start_pos: [100.0, 100.0],
                end_pos: [150.0, 100.0],
            },
        }
    }

    fn disappearance(alarm_id: i64, ts: f64) -> EventMessage {
        EventMessage {
            kind: EventKind::Disappearance,
            alarm_id,
            user_id: 42,
            track_id: 7,
            timestamp: ts,
            details: EventDetails::Disappearance { time_seconds: 6.0 },
        }
    }

    #[test]
    fn test_movement_persists_and_notifies() {
        let f = fixture(true);
        f.processor
            .handle_event(&movement(f.alarm_id, 100.0), at(100))
            .unwrap();

        assert_eq!(f.notifier.sent_count(), 1);
        let alarm = f.storage.get_alarm(f.alarm_id).unwrap().unwrap();
        assert_eq!(alarm.last_notification_at, Some(at(100)));
        let stored = f
            .storage
            .find_event_near(f.alarm_id, EventKind::Movement, at(100), Duration::seconds(5))
            .unwrap();
        assert!(stored.is_some());
    }

    #[test]
    fn test_cooldown_suppresses_second_notification() {
        let f = fixture(true);
        f.processor
            .handle_event(&movement(f.alarm_id, 100.0), at(100))
            .unwrap();
        f.processor
            .handle_event(&movement(f.alarm_id, 130.0), at(130))
            .unwrap();
        assert_eq!(f.notifier.sent_count(), 1);

        // Past the cooldown the next movement notifies again.
        f.processor
            .handle_event(&movement(f.alarm_id, 161.0), at(161))
            .unwrap();
        assert_eq!(f.notifier.sent_count(), 2);
    }

    #[test]
    fn test_disappearance_deactivates_and_clears_registry() {
        let f = fixture(true);
        f.processor
            .handle_event(&disappearance(f.alarm_id, 100.0), at(100))
            .unwrap();

        let alarm = f.storage.get_alarm(f.alarm_id).unwrap().unwrap();
        assert!(!alarm.is_active);
        assert_eq!(alarm.unset_at, Some(at(100)));
        assert!(f.alarms.is_empty());
        // No cooldown on the terminal event.
        assert_eq!(f.notifier.sent_count(), 1);
    }

    #[test]
    fn test_disappearance_accepted_for_inactive_alarm() {
        let f = fixture(true);
        f.storage.deactivate_alarm(f.alarm_id, at(50)).unwrap();

        f.processor
            .handle_event(&disappearance(f.alarm_id, 100.0), at(100))
            .unwrap();

        // Logged as an event, but the earlier unset time stands.
        let alarm = f.storage.get_alarm(f.alarm_id).unwrap().unwrap();
        assert_eq!(alarm.unset_at, Some(at(50)));
        let stored = f
            .storage
            .find_event_near(
                f.alarm_id,
                EventKind::Disappearance,
                at(100),
                Duration::seconds(5),
            )
            .unwrap();
        assert!(stored.is_some());
    }

    #[test]
    fn test_movement_against_inactive_alarm_is_dropped() {
        let f = fixture(true);
        f.storage.deactivate_alarm(f.alarm_id, at(50)).unwrap();

        f.processor
            .handle_event(&movement(f.alarm_id, 100.0), at(100))
            .unwrap();

        assert_eq!(f.notifier.sent_count(), 0);
        let stored = f
            .storage
            .find_event_near(f.alarm_id, EventKind::Movement, at(100), Duration::seconds(5))
            .unwrap();
        assert!(stored.is_none());
    }

    #[test]
    fn test_owner_mismatch_is_dropped() {
        let f = fixture(true);
        let mut event = movement(f.alarm_id, 100.0);
        event.user_id = 999;

        f.processor.handle_event(&event, at(100)).unwrap();

        assert_eq!(f.notifier.sent_count(), 0);
        let stored = f
            .storage
            .find_event_near(f.alarm_id, EventKind::Movement, at(100), Duration::seconds(5))
            .unwrap();
        assert!(stored.is_none());
    }

    #[test]
    fn test_missing_alarm_is_dropped() {
        let f = fixture(true);
        f.processor.handle_event(&movement(555, 100.0), at(100)).unwrap();
        assert_eq!(f.notifier.sent_count(), 0);
    }

    #[test]
    fn test_no_linked_chat_skips_notification_but_persists() {
        let f = fixture(true);
        f.storage.add_user(User {
            id: 42,
            username: "owner".to_string(),
            chat_id: None,
            notify_movement: true,
            notify_disappearance: true,
        });

        f.processor
            .handle_event(&movement(f.alarm_id, 100.0), at(100))
            .unwrap();

        assert_eq!(f.notifier.sent_count(), 0);
        let stored = f
            .storage
            .find_event_near(f.alarm_id, EventKind::Movement, at(100), Duration::seconds(5))
            .unwrap();
        assert!(stored.is_some());
    }

    #[test]
    fn test_disabled_preference_skips_notification() {
        let f = fixture(true);
        f.storage.add_user(User {
            id: 42,
            username: "owner".to_string(),
            chat_id: Some("chat-42".to_string()),
            notify_movement: false,
            notify_disappearance: true,
        });

        f.processor
            .handle_event(&movement(f.alarm_id, 100.0), at(100))
            .unwrap();
        assert_eq!(f.notifier.sent_count(), 0);

        f.processor
            .handle_event(&disappearance(f.alarm_id, 101.0), at(101))
            .unwrap();
        assert_eq!(f.notifier.sent_count(), 1);
    }

    #[test]
    fn test_failed_send_leaves_cooldown_clock_untouched() {
        let f = fixture(false);
        f.processor
            .handle_event(&movement(f.alarm_id, 100.0), at(100))
            .unwrap();

        assert_eq!(f.notifier.sent_count(), 1);
        let alarm = f.storage.get_alarm(f.alarm_id).unwrap().unwrap();
        assert_eq!(alarm.last_notification_at, None);
    }
}
