// src/storage.rs
//
// Persistence contract for users, alarms and alarm events. The relational
// layer itself is an external collaborator; this trait is the seam the
// workers talk to. The in-memory implementation backs tests and standalone
// runs.

use crate::types::EventKind;
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Linked chat for notifications; `None` means no channel.
    pub chat_id: Option<String>,
    pub notify_movement: bool,
    pub notify_disappearance: bool,
}

#[derive(Debug, Clone)]
pub struct Alarm {
    pub id: i64,
    pub user_id: i64,
    pub vehicle_track_id: i64,
    pub set_at: DateTime<Utc>,
    pub unset_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub last_notification_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AlarmEvent {
    pub id: i64,
    pub alarm_id: i64,
    pub event_type: EventKind,
    pub timestamp: DateTime<Utc>,
    pub details_json: Option<String>,
    pub video_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAlarmEvent {
    pub alarm_id: i64,
    pub event_type: EventKind,
    pub timestamp: DateTime<Utc>,
    pub details_json: Option<String>,
}

pub trait Storage: Send + Sync {
    fn get_user(&self, user_id: i64) -> Result<Option<User>>;
    fn get_alarm(&self, alarm_id: i64) -> Result<Option<Alarm>>;

    /// Rejects a second active alarm for the same `(user, vehicle)` pair.
    fn create_alarm(&self, user_id: i64, vehicle_track_id: i64, now: DateTime<Utc>)
        -> Result<Alarm>;

    /// true→false only; a new arm request creates a new row.
    fn deactivate_alarm(&self, alarm_id: i64, when: DateTime<Utc>) -> Result<()>;

    fn set_last_notification(&self, alarm_id: i64, when: DateTime<Utc>) -> Result<()>;

    fn insert_event(&self, event: NewAlarmEvent) -> Result<i64>;

    /// Best-effort lookup for clip correlation: most recent event of the
    /// given alarm and type within `tolerance` of `around`.
    fn find_event_near(
        &self,
        alarm_id: i64,
        event_type: EventKind,
        around: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Option<AlarmEvent>>;

    fn set_event_video_path(&self, event_id: i64, video_path: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    users: HashMap<i64, User>,
    alarms: HashMap<i64, Alarm>,
    events: HashMap<i64, AlarmEvent>,
    next_alarm_id: i64,
    next_event_id: i64,
}

/// Hash-map storage guarded by one lock, so each trait call applies as a
/// unit the way a per-event transaction would.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: User) {
        self.inner.lock().unwrap().users.insert(user.id, user);
    }
}

impl Storage for MemoryStorage {
    fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        Ok(self.inner.lock().unwrap().users.get(&user_id).cloned())
    }

    fn get_alarm(&self, alarm_id: i64) -> Result<Option<Alarm>> {
        Ok(self.inner.lock().unwrap().alarms.get(&alarm_id).cloned())
    }

    fn create_alarm(
        &self,
        user_id: i64,
        vehicle_track_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Alarm> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner.alarms.values().any(|a| {
            a.is_active && a.user_id == user_id && a.vehicle_track_id == vehicle_track_id
        });
        if duplicate {
            bail!(
                "user {} already has an active alarm on track {}",
                user_id,
                vehicle_track_id
            );
        }

        inner.next_alarm_id += 1;
        let alarm = Alarm {
            id: inner.next_alarm_id,
            user_id,
            vehicle_track_id,
            set_at: now,
            unset_at: None,
            is_active: true,
            last_notification_at: None,
        };
        inner.alarms.insert(alarm.id, alarm.clone());
        Ok(alarm)
    }

    fn deactivate_alarm(&self, alarm_id: i64, when: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(alarm) = inner.alarms.get_mut(&alarm_id) else {
            bail!("alarm {} not found", alarm_id);
        };
        if alarm.is_active {
            alarm.is_active = false;
            alarm.unset_at = Some(when);
        }
        Ok(())
    }

    fn set_last_notification(&self, alarm_id: i64, when: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(alarm) = inner.alarms.get_mut(&alarm_id) else {
            bail!("alarm {} not found", alarm_id);
        };
        alarm.last_notification_at = Some(when);
        Ok(())
    }

    fn insert_event(&self, event: NewAlarmEvent) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.events.insert(
            id,
            AlarmEvent {
                id,
                alarm_id: event.alarm_id,
                event_type: event.event_type,
                timestamp: event.timestamp,
                details_json: event.details_json,
                video_path: None,
            },
        );
        Ok(id)
    }

    fn find_event_near(
        &self,
        alarm_id: i64,
        event_type: EventKind,
        around: DateTime<Utc>,
        tolerance: Duration,
    ) -> Result<Option<AlarmEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .values()
            .filter(|e| {
                e.alarm_id == alarm_id
                    && e.event_type == event_type
                    && (e.timestamp - around).abs() <= tolerance
            })
            .max_by_key(|e| e.timestamp)
            .cloned())
    }

    fn set_event_video_path(&self, event_id: i64, video_path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(event) = inner.events.get_mut(&event_id) else {
            bail!("alarm event {} not found", event_id);
        };
        event.video_path = Some(video_path.to_string());
        Ok(())
    }
}
