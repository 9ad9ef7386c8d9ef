use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct ActivityState {
    inner: RwLock<Inner>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Inner {
    last_ide_activity: Option<DateTime<Utc>>,
    last_ssh_activity: Option<DateTime<Utc>>,
    active_ide: u32,
    active_ssh: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActivitySnapshot {
    #[serde(rename = "lastIDEActivity")]
    pub last_ide_activity: Option<DateTime<Utc>>,
    #[serde(rename = "lastSSHActivity")]
    pub last_ssh_activity: Option<DateTime<Utc>>,
    #[serde(rename = "activeIDEConnections")]
    pub active_ide: u32,
    #[serde(rename = "activeSSHConnections")]
    pub active_ssh: u32,
}

impl ActivitySnapshot {
    pub fn latest_activity(&self) -> Option<DateTime<Utc>> {
        match (self.last_ide_activity, self.last_ssh_activity) {
            (Some(ide), Some(ssh)) => Some(ide.max(ssh)),
            (Some(ide), None) => Some(ide),
            (None, Some(ssh)) => Some(ssh),
            (None, None) => None,
        }
    }
}

impl ActivityState {
    pub async fn update_ide(&self, timestamp: DateTime<Utc>, connections: u32) {
        let mut guard = self.inner.write().await;
        guard.active_ide = connections;
        if connections > 0 {
            guard.last_ide_activity = Some(timestamp);
        }
    }

    pub async fn update_ssh(&self, timestamp: DateTime<Utc>, connections: u32) {
        let mut guard = self.inner.write().await;
        guard.active_ssh = connections;
        if connections > 0 {
            guard.last_ssh_activity = Some(timestamp);
        }
    }

    pub async fn snapshot(&self) -> ActivitySnapshot {
        let guard = self.inner.read().await;
        ActivitySnapshot {
            last_ide_activity: guard.last_ide_activity,
            last_ssh_activity: guard.last_ssh_activity,
            active_ide: guard.active_ide,
            active_ssh: guard.active_ssh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn new_state_is_empty() {
        let state = ActivityState::default();
        let snapshot = state.snapshot().await;

        assert_eq!(snapshot.active_ide, 0);
        assert_eq!(snapshot.active_ssh, 0);
        assert!(snapshot.last_ide_activity.is_none());
        assert!(snapshot.last_ssh_activity.is_none());
    }

    #[tokio::test]
    async fn update_sets_count_and_timestamp() {
        let state = ActivityState::default();
        let now = Utc::now();

        state.update_ide(now, 2).await;
        state.update_ssh(now, 1).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.active_ide, 2);
        assert_eq!(snapshot.active_ssh, 1);
        assert_eq!(snapshot.last_ide_activity, Some(now));
        assert_eq!(snapshot.last_ssh_activity, Some(now));
    }

    #[tokio::test]
    async fn zero_count_keeps_last_activity() {
        let state = ActivityState::default();
        let earlier = Utc::now();

        state.update_ide(earlier, 3).await;
        state.update_ide(earlier + Duration::seconds(30), 0).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.active_ide, 0, "счётчик должен сбрасываться в 0");
        assert_eq!(
            snapshot.last_ide_activity,
            Some(earlier),
            "нулевое значение не должно стирать время последней активности"
        );
    }

    #[tokio::test]
    async fn zero_count_without_prior_activity_keeps_none() {
        let state = ActivityState::default();
        state.update_ssh(Utc::now(), 0).await;

        let snapshot = state.snapshot().await;
        assert!(snapshot.last_ssh_activity.is_none());
    }

    #[tokio::test]
    async fn snapshot_reflects_latest_update_per_channel() {
        let state = ActivityState::default();
        let first = Utc::now();
        let second = first + Duration::seconds(10);

        state.update_ide(first, 5).await;
        state.update_ide(second, 7).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.active_ide, 7);
        assert_eq!(snapshot.last_ide_activity, Some(second));
    }

    #[tokio::test]
    async fn snapshots_are_independent_copies() {
        let state = ActivityState::default();
        let now = Utc::now();

        state.update_ide(now, 5).await;
        let before = state.snapshot().await;

        state.update_ide(now + Duration::seconds(1), 10).await;
        let after = state.snapshot().await;

        assert_eq!(before.active_ide, 5, "старый снимок не должен меняться");
        assert_eq!(after.active_ide, 10);
    }

    #[tokio::test]
    async fn concurrent_writers_and_readers() {
        let state = Arc::new(ActivityState::default());
        let mut tasks = Vec::new();

        for i in 0..100_u32 {
            let writer = state.clone();
            tasks.push(tokio::spawn(async move {
                writer.update_ide(Utc::now(), i).await;
                writer.update_ssh(Utc::now(), i).await;
            }));
            let reader = state.clone();
            tasks.push(tokio::spawn(async move {
                let _ = reader.snapshot().await;
            }));
        }

        for task in tasks {
            task.await.expect("задача не должна паниковать");
        }
    }

    #[test]
    fn latest_activity_picks_most_recent() {
        let now = Utc::now();
        let past = now - Duration::hours(1);

        let snapshot = |ide, ssh| ActivitySnapshot {
            last_ide_activity: ide,
            last_ssh_activity: ssh,
            active_ide: 0,
            active_ssh: 0,
        };

        assert_eq!(snapshot(None, None).latest_activity(), None);
        assert_eq!(snapshot(Some(now), None).latest_activity(), Some(now));
        assert_eq!(snapshot(None, Some(now)).latest_activity(), Some(now));
        assert_eq!(snapshot(Some(now), Some(past)).latest_activity(), Some(now));
        assert_eq!(snapshot(Some(past), Some(now)).latest_activity(), Some(now));
    }

    #[test]
    fn snapshot_serializes_wire_field_names() {
        let snapshot = ActivitySnapshot {
            last_ide_activity: None,
            last_ssh_activity: None,
            active_ide: 2,
            active_ssh: 0,
        };

        let value = serde_json::to_value(snapshot).expect("сериализация снимка");
        assert!(value.get("lastIDEActivity").is_some());
        assert!(value.get("lastSSHActivity").is_some());
        assert_eq!(value["activeIDEConnections"], 2);
        assert_eq!(value["activeSSHConnections"], 0);
    }
}
