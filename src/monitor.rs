//! # Room and Task Monitor
//!
//! Read-mostly bookkeeping about every room the relay knows: how many clients
//! it has, whether its translation connection is up, how much traffic the
//! connection carried, and which background tasks the room is running.
//!
//! The monitor never drives behaviour. Rooms report into it and the HTTP
//! surface reads snapshots out of it. Two derived signals feed the health check:
//!
//! - **Zombie connection**: marked connected, has received at least one
//!   message, but nothing arrived for more than 5 minutes
//! - **Long-running task**: still running more than 30 minutes after it started
//!
//! ## Key Rust Concepts:
//! - **RAII guard**: `start_task` hands back a `TaskGuard`; dropping it marks the
//!   task stopped, so a task that returns early or panics is still accounted for
//! - **Explicit now**: the `*_at(now)` variants take the clock as a parameter so
//!   thresholds can be tested without sleeping

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const ZOMBIE_IDLE_MINUTES: i64 = 5;
const LONG_RUNNING_MINUTES: i64 = 30;

const CRITICAL_ZOMBIES: usize = 5;
const CRITICAL_LONG_RUNNING: usize = 50;
const WARNING_ZOMBIES: usize = 2;
const WARNING_LONG_RUNNING: usize = 20;

/// Stopped task records kept per room for inspection.
const STOPPED_TASK_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    RoomEventLoop,
    ConnectionStarter,
    TranslationReader,
    Reconnect,
    ReverseTranslation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: u64,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// State of a room's translation backend connection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub from_language: String,
    pub to_language: String,
    pub reconnect_count: u64,
    pub message_count: u64,
    pub audio_packet_count: u64,
    pub last_message_time: Option<DateTime<Utc>>,
    pub connection_start: Option<DateTime<Utc>>,
    pub connection_duration_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStatus {
    pub room_id: String,
    pub room_type: String,
    pub client_count: usize,
    pub connection: ConnectionInfo,
    pub tasks: Vec<TaskInfo>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Which incarnation of the room owns this entry
    #[serde(skip)]
    generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LongRunningTask {
    pub room_id: String,
    pub kind: TaskKind,
    pub running_secs: i64,
}

/// Snapshot of every room plus the derived problem lists.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub timestamp: DateTime<Utc>,
    pub total_rooms: usize,
    pub active_connections: usize,
    pub running_tasks: usize,
    pub zombie_connections: Vec<String>,
    pub long_running_tasks: Vec<LongRunningTask>,
    pub rooms: Vec<RoomStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub zombie_count: usize,
    pub long_running_count: usize,
    pub total_rooms: usize,
    pub active_connections: usize,
    pub running_tasks: usize,
}

impl HealthLevel {
    pub fn classify(zombies: usize, long_running: usize) -> Self {
        if zombies > CRITICAL_ZOMBIES || long_running > CRITICAL_LONG_RUNNING {
            HealthLevel::Critical
        } else if zombies > WARNING_ZOMBIES || long_running > WARNING_LONG_RUNNING {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[derive(Debug, Default)]
pub struct Monitor {
    rooms: RwLock<HashMap<String, RoomStatus>>,
    next_task_id: AtomicU64,
    next_generation: AtomicU64,
}

impl Monitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start tracking a room. A room that replaces an earlier one with the
    /// same id takes the entry over; the returned generation identifies it
    /// when it unregisters.
    pub fn register_room(&self, room_id: &str, room_type: &str) -> u64 {
        let now = Utc::now();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.rooms.write().insert(
            room_id.to_string(),
            RoomStatus {
                room_id: room_id.to_string(),
                room_type: room_type.to_string(),
                client_count: 0,
                connection: ConnectionInfo::default(),
                tasks: Vec::new(),
                created_at: now,
                last_activity: now,
                generation,
            },
        );
        debug!(room_id = %room_id, generation, "room registered with monitor");
        generation
    }

    /// Stop tracking a room, unless a newer room already took its entry over.
    pub fn unregister_room(&self, room_id: &str, generation: u64) {
        let mut rooms = self.rooms.write();
        if rooms.get(room_id).is_some_and(|room| room.generation == generation) {
            rooms.remove(room_id);
            debug!(room_id = %room_id, generation, "room removed from monitor");
        }
    }

    pub fn update_client_count(&self, room_id: &str, count: usize) {
        self.with_room(room_id, |room| room.client_count = count);
    }

    /// Record a connect or disconnect of the room's backend connection.
    pub fn update_connection(&self, room_id: &str, connected: bool, from: &str, to: &str) {
        self.with_room(room_id, |room| {
            let conn = &mut room.connection;
            if connected && !conn.connected {
                conn.connection_start = Some(Utc::now());
            }
            if !connected {
                conn.connection_start = None;
            }
            conn.connected = connected;
            conn.from_language = from.to_string();
            conn.to_language = to.to_string();
        });
    }

    pub fn record_reconnect(&self, room_id: &str) {
        self.with_room(room_id, |room| room.connection.reconnect_count += 1);
    }

    /// Count one frame received from the backend.
    pub fn record_message(&self, room_id: &str, is_audio: bool) {
        self.with_room(room_id, |room| {
            if is_audio {
                room.connection.audio_packet_count += 1;
            } else {
                room.connection.message_count += 1;
            }
            room.connection.last_message_time = Some(Utc::now());
        });
    }

    /// Track a background task of `room_id` until the guard is dropped.
    pub fn start_task(self: &Arc<Self>, room_id: &str, kind: TaskKind) -> TaskGuard {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.with_room(room_id, |room| {
            room.tasks.push(TaskInfo {
                id,
                kind,
                status: TaskStatus::Running,
                created_at: Utc::now(),
            });
        });
        TaskGuard {
            monitor: Arc::clone(self),
            room_id: room_id.to_string(),
            id,
        }
    }

    fn finish_task(&self, room_id: &str, id: u64) {
        let mut rooms = self.rooms.write();
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        if let Some(task) = room.tasks.iter_mut().find(|t| t.id == id) {
            task.status = TaskStatus::Stopped;
        }

        let stopped = room
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Stopped)
            .count();
        if stopped > STOPPED_TASK_HISTORY {
            let mut excess = stopped - STOPPED_TASK_HISTORY;
            room.tasks.retain(|t| {
                if excess > 0 && t.status == TaskStatus::Stopped {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Mark a room's connection inactive. Returns whether the room is known.
    pub fn force_close(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get_mut(room_id) {
            Some(room) => {
                room.connection.connected = false;
                room.connection.connection_start = None;
                room.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn room_status(&self, room_id: &str) -> Option<RoomStatus> {
        let now = Utc::now();
        self.rooms
            .read()
            .get(room_id)
            .map(|room| with_duration(room.clone(), now))
    }

    pub fn running_tasks(&self) -> usize {
        self.rooms
            .read()
            .values()
            .flat_map(|room| room.tasks.iter())
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    pub fn system_status(&self) -> SystemStatus {
        self.system_status_at(Utc::now())
    }

    pub fn system_status_at(&self, now: DateTime<Utc>) -> SystemStatus {
        let rooms = self.rooms.read();
        let zombie_after = Duration::minutes(ZOMBIE_IDLE_MINUTES);
        let long_after = Duration::minutes(LONG_RUNNING_MINUTES);

        let mut zombie_connections = Vec::new();
        let mut long_running_tasks = Vec::new();
        let mut active_connections = 0;
        let mut running_tasks = 0;

        for room in rooms.values() {
            let conn = &room.connection;
            if conn.connected {
                active_connections += 1;
                if let Some(last) = conn.last_message_time {
                    if now - last > zombie_after {
                        zombie_connections.push(room.room_id.clone());
                    }
                }
            }

            for task in room.tasks.iter().filter(|t| t.status == TaskStatus::Running) {
                running_tasks += 1;
                let age = now - task.created_at;
                if age > long_after {
                    long_running_tasks.push(LongRunningTask {
                        room_id: room.room_id.clone(),
                        kind: task.kind,
                        running_secs: age.num_seconds(),
                    });
                }
            }
        }

        SystemStatus {
            timestamp: now,
            total_rooms: rooms.len(),
            active_connections,
            running_tasks,
            zombie_connections,
            long_running_tasks,
            rooms: rooms.values().map(|r| with_duration(r.clone(), now)).collect(),
        }
    }

    pub fn health(&self) -> HealthReport {
        self.health_at(Utc::now())
    }

    pub fn health_at(&self, now: DateTime<Utc>) -> HealthReport {
        let status = self.system_status_at(now);
        let zombie_count = status.zombie_connections.len();
        let long_running_count = status.long_running_tasks.len();

        HealthReport {
            status: HealthLevel::classify(zombie_count, long_running_count),
            zombie_count,
            long_running_count,
            total_rooms: status.total_rooms,
            active_connections: status.active_connections,
            running_tasks: status.running_tasks,
        }
    }

    fn with_room(&self, room_id: &str, update: impl FnOnce(&mut RoomStatus)) {
        if let Some(room) = self.rooms.write().get_mut(room_id) {
            update(room);
            room.last_activity = Utc::now();
        }
    }
}

fn with_duration(mut room: RoomStatus, now: DateTime<Utc>) -> RoomStatus {
    room.connection.connection_duration_secs = match room.connection.connection_start {
        Some(start) if room.connection.connected => (now - start).num_seconds(),
        _ => 0,
    };
    room
}

/// Marks its task stopped when dropped.
pub struct TaskGuard {
    monitor: Arc<Monitor>,
    room_id: String,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.monitor.finish_task(&self.room_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_thresholds() {
        assert_eq!(HealthLevel::classify(0, 0), HealthLevel::Healthy);
        assert_eq!(HealthLevel::classify(2, 20), HealthLevel::Healthy);
        assert_eq!(HealthLevel::classify(3, 0), HealthLevel::Warning);
        assert_eq!(HealthLevel::classify(0, 21), HealthLevel::Warning);
        assert_eq!(HealthLevel::classify(6, 0), HealthLevel::Critical);
        assert_eq!(HealthLevel::classify(0, 51), HealthLevel::Critical);
    }

    #[test]
    fn test_task_guard_marks_stopped() {
        let monitor = Monitor::new();
        monitor.register_room("r1", "translation");

        let guard = monitor.start_task("r1", TaskKind::TranslationReader);
        assert_eq!(monitor.running_tasks(), 1);
        drop(guard);
        assert_eq!(monitor.running_tasks(), 0);

        let status = monitor.room_status("r1").unwrap();
        assert_eq!(status.tasks.len(), 1);
        assert_eq!(status.tasks[0].status, TaskStatus::Stopped);
    }

    #[test]
    fn test_stopped_history_is_bounded() {
        let monitor = Monitor::new();
        monitor.register_room("r1", "translation");
        for _ in 0..(STOPPED_TASK_HISTORY + 10) {
            drop(monitor.start_task("r1", TaskKind::ReverseTranslation));
        }
        assert_eq!(monitor.room_status("r1").unwrap().tasks.len(), STOPPED_TASK_HISTORY);
    }

    #[test]
    fn test_zombie_detection() {
        let monitor = Monitor::new();
        monitor.register_room("r1", "translation");
        monitor.register_room("r2", "translation");
        monitor.update_connection("r1", true, "en", "es");
        monitor.update_connection("r2", true, "en", "fr");
        monitor.record_message("r1", false);

        // r2 never received anything, so it cannot be a zombie
        let later = Utc::now() + Duration::minutes(6);
        let status = monitor.system_status_at(later);
        assert_eq!(status.active_connections, 2);
        assert_eq!(status.zombie_connections, vec!["r1".to_string()]);

        let soon = Utc::now() + Duration::minutes(1);
        assert!(monitor.system_status_at(soon).zombie_connections.is_empty());
    }

    #[test]
    fn test_long_running_tasks_feed_health() {
        let monitor = Monitor::new();
        monitor.register_room("r1", "translation");
        let _guards: Vec<_> = (0..21)
            .map(|_| monitor.start_task("r1", TaskKind::RoomEventLoop))
            .collect();

        let later = Utc::now() + Duration::minutes(31);
        let report = monitor.health_at(later);
        assert_eq!(report.long_running_count, 21);
        assert_eq!(report.status, HealthLevel::Warning);
        assert_eq!(monitor.health().status, HealthLevel::Healthy);
    }

    #[test]
    fn test_force_close() {
        let monitor = Monitor::new();
        assert!(!monitor.force_close("missing"));

        monitor.register_room("r1", "translation");
        monitor.update_connection("r1", true, "en", "es");
        assert!(monitor.force_close("r1"));
        assert!(!monitor.room_status("r1").unwrap().connection.connected);
    }

    #[test]
    fn test_counters() {
        let monitor = Monitor::new();
        monitor.register_room("r1", "translation");
        monitor.record_message("r1", true);
        monitor.record_message("r1", false);
        monitor.record_reconnect("r1");
        monitor.update_client_count("r1", 3);

        let status = monitor.room_status("r1").unwrap();
        assert_eq!(status.connection.audio_packet_count, 1);
        assert_eq!(status.connection.message_count, 1);
        assert_eq!(status.connection.reconnect_count, 1);
        assert_eq!(status.client_count, 3);
    }

    #[test]
    fn test_replaced_room_keeps_its_entry() {
        let monitor = Monitor::new();
        let first = monitor.register_room("r1", "translation");
        monitor.update_client_count("r1", 4);

        let second = monitor.register_room("r1", "translation");
        assert_ne!(first, second);
        assert_eq!(monitor.room_status("r1").unwrap().client_count, 0);

        // the dead room's late cleanup leaves the new entry alone
        monitor.unregister_room("r1", first);
        assert!(monitor.room_status("r1").is_some());

        monitor.unregister_room("r1", second);
        assert!(monitor.room_status("r1").is_none());
    }
}
