use crate::config::Config;
use crate::mount::{MountError, MountManager};
use crate::state::{ActivitySnapshot, ActivityState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("не удалось обеспечить монтирование: {0}")]
    Mount(#[from] MountError),
    #[error("не удалось создать каталог назначения {path}: {source}")]
    CreateDestination {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось запустить {tool}: {source}")]
    SpawnCopy {
        tool: String,
        source: std::io::Error,
    },
    #[error("инструмент копирования завершился с ошибкой: {0}")]
    CopyFailed(ExitStatus),
}

#[derive(Debug, Serialize)]
struct BackupRun {
    timestamp: DateTime<Utc>,
    workspace: String,
    #[serde(rename = "snapshotDestination")]
    snapshot_destination: String,
    #[serde(rename = "activeIDE")]
    active_ide: u32,
    #[serde(rename = "activeSSH")]
    active_ssh: u32,
}

pub struct BackupScheduler {
    enabled: bool,
    interval: Duration,
    workspace_dir: String,
    mount_path: String,
    snapshot_base_path: String,
    excludes: Vec<String>,
    sync_on_activity: bool,
    rsync_bin: String,

    mount: MountManager,
    state: Arc<ActivityState>,
}

impl BackupScheduler {
    pub fn new(cfg: &Config, mount: MountManager, state: Arc<ActivityState>) -> Self {
        Self {
            enabled: cfg.backup.enabled,
            interval: Duration::from_secs(cfg.backup.interval_secs),
            workspace_dir: cfg.workspace_dir.clone(),
            mount_path: cfg.mount.path.clone(),
            snapshot_base_path: cfg.backup.snapshot_base_path.clone(),
            excludes: cfg.backup.cleaned_excludes(),
            sync_on_activity: cfg.backup.sync_on_activity,
            rsync_bin: cfg.backup.rsync_bin.clone(),
            mount,
            state,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BackupError> {
        if !self.enabled {
            info!("резервное копирование отключено конфигурацией");
            return Ok(());
        }

        info!(
            interval_secs = self.interval.as_secs(),
            mount = %self.mount_path,
            "запущено резервное копирование"
        );

        if let Err(err) = self.perform_backup(true).await {
            error!(error = %err, "стартовое резервное копирование не выполнено");
        }

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("резервное копирование остановлено");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.perform_backup(false).await {
                        error!(error = %err, "плановое резервное копирование не выполнено");
                    }
                }
            }
        }
    }

    async fn perform_backup(&mut self, startup: bool) -> Result<(), BackupError> {
        let snapshot = self.state.snapshot().await;

        if self.sync_on_activity && !should_run(&snapshot, self.interval, Utc::now(), startup) {
            return Ok(());
        }

        self.mount.ensure().await?;

        let destination = Path::new(&self.mount_path)
            .join(&self.snapshot_base_path)
            .join("current");
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|source| BackupError::CreateDestination {
                path: destination.display().to_string(),
                source,
            })?;

        info!(destination = %destination.display(), "начато зеркалирование рабочего пространства");
        let status = self.run_copy_tool(&destination).await?;
        if !status.success() {
            return Err(BackupError::CopyFailed(status));
        }

        let metadata = BackupRun {
            timestamp: Utc::now(),
            workspace: self.workspace_dir.clone(),
            snapshot_destination: destination.display().to_string(),
            active_ide: snapshot.active_ide,
            active_ssh: snapshot.active_ssh,
        };
        self.write_metadata(&metadata).await;

        Ok(())
    }

    async fn run_copy_tool(&self, destination: &Path) -> Result<ExitStatus, BackupError> {
        let mut cmd = Command::new(&self.rsync_bin);
        cmd.arg("-a").arg("--delete");
        for pattern in &self.excludes {
            cmd.arg("--exclude").arg(pattern);
        }
        cmd.arg(with_trailing_slash(&self.workspace_dir));
        cmd.arg(with_trailing_slash(&destination.display().to_string()));

        cmd.status().await.map_err(|source| BackupError::SpawnCopy {
            tool: self.rsync_bin.clone(),
            source,
        })
    }

    async fn write_metadata(&self, metadata: &BackupRun) {
        let meta_path = PathBuf::from(&self.mount_path).join("backup-status.json");
        let payload = match serde_json::to_vec_pretty(metadata) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "не удалось сериализовать метаданные бэкапа");
                return;
            }
        };

        match tokio::fs::write(&meta_path, payload).await {
            Ok(()) => {
                info!(metadata = %meta_path.display(), "резервное копирование завершено");
            }
            Err(err) => {
                warn!(
                    error = %err,
                    path = %meta_path.display(),
                    "не удалось сохранить метаданные бэкапа"
                );
            }
        }
    }
}

fn should_run(
    snapshot: &ActivitySnapshot,
    interval: Duration,
    now: DateTime<Utc>,
    startup: bool,
) -> bool {
    if snapshot.active_ide > 0 || snapshot.active_ssh > 0 {
        return true;
    }
    if startup {
        return true;
    }

    let Some(last_activity) = snapshot.latest_activity() else {
        debug!("пропускаем бэкап: активность ещё не фиксировалась");
        return false;
    };

    let idle = now.signed_duration_since(last_activity);
    match chrono::Duration::from_std(interval) {
        Ok(max_idle) if idle > max_idle => {
            debug!(
                idle_secs = idle.num_seconds(),
                "пропускаем бэкап: рабочее пространство простаивает"
            );
            false
        }
        _ => true,
    }
}

fn with_trailing_slash(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}
