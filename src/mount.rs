use crate::config::MountConfig;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{info, warn};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum MountError {
    #[error("некорректная конфигурация монтирования: {0}")]
    InvalidConfig(String),
    #[error("не удалось прочитать таблицу монтирования: {0}")]
    MountTable(#[from] procfs::ProcError),
    #[error("не удалось создать каталог {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось сформировать конфигурацию драйвера: {0}")]
    RenderConfig(#[from] serde_yaml::Error),
    #[error("не удалось записать конфигурацию драйвера: {0}")]
    WriteConfig(std::io::Error),
    #[error("не удалось запустить {tool}: {source}")]
    SpawnTool {
        tool: String,
        source: std::io::Error,
    },
    #[error("инструмент монтирования завершился с ошибкой: {0}")]
    ToolFailed(ExitStatus),
    #[error("монтирование не стало готовым за отведённое время")]
    NotReady,
}

pub struct MountManager {
    cfg: MountConfig,
    mounted: bool,
}

#[derive(Debug, Serialize)]
struct DriverConfig {
    components: Vec<&'static str>,
    libfuse: LibfuseSection,
    file_cache: FileCacheSection,
    azstorage: AzStorageSection,
}

#[derive(Debug, Serialize)]
struct LibfuseSection {
    #[serde(rename = "attribute-expiration-sec")]
    attribute_expiration_sec: u32,
}

#[derive(Debug, Serialize)]
struct FileCacheSection {
    path: String,
    #[serde(rename = "max-size-mb")]
    max_size_mb: u32,
    #[serde(rename = "cleanup-on-close")]
    cleanup_on_close: bool,
}

#[derive(Debug, Serialize)]
struct AzStorageSection {
    #[serde(rename = "account-name")]
    account_name: String,
    container: String,
    endpoint: String,
    #[serde(rename = "account-key", skip_serializing_if = "Option::is_none")]
    account_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sas: Option<String>,
}

impl MountManager {
    pub fn new(cfg: MountConfig) -> Self {
        Self {
            cfg,
            mounted: false,
        }
    }

    pub async fn ensure(&mut self) -> Result<(), MountError> {
        if !self.cfg.ensure {
            return Ok(());
        }

        if self.mounted {
            if is_mounted(&self.cfg.path)? {
                return Ok(());
            }
            warn!(
                path = %self.cfg.path,
                "монтирование было готово, но пропало из таблицы, перемонтируем"
            );
            self.mounted = false;
        }

        validate(&self.cfg)?;

        create_dir(&self.cfg.path)?;
        create_dir(&self.cfg.temp_path)?;

        if is_mounted(&self.cfg.path)? {
            self.mounted = true;
            return Ok(());
        }

        let config_file = self.write_driver_config()?;
        let status = self.run_mount_tool(config_file.path()).await;
        drop(config_file);

        let status = status?;
        if !status.success() {
            return Err(MountError::ToolFailed(status));
        }

        let deadline = Instant::now() + READY_TIMEOUT;
        while Instant::now() < deadline {
            if is_mounted(&self.cfg.path)? {
                info!(path = %self.cfg.path, "монтирование blob-хранилища готово");
                self.mounted = true;
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        Err(MountError::NotReady)
    }

    fn write_driver_config(&self) -> Result<NamedTempFile, MountError> {
        let endpoint = match self.cfg.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
            _ => format!("https://{}.blob.core.windows.net", self.cfg.account_name),
        };

        let driver_cfg = DriverConfig {
            components: vec!["libfuse", "attr_cache", "azstorage", "file_cache"],
            libfuse: LibfuseSection {
                attribute_expiration_sec: 120,
            },
            file_cache: FileCacheSection {
                path: PathBuf::from(&self.cfg.temp_path)
                    .join("cache")
                    .to_string_lossy()
                    .into_owned(),
                max_size_mb: 4096,
                cleanup_on_close: true,
            },
            azstorage: AzStorageSection {
                account_name: self.cfg.account_name.clone(),
                container: self.cfg.container.clone(),
                endpoint,
                account_key: self.cfg.account_key.clone(),
                sas: self.cfg.sas_token.clone(),
            },
        };

        let text = serde_yaml::to_string(&driver_cfg)?;

        let mut file = tempfile::Builder::new()
            .prefix("blobfuse2-")
            .suffix(".yaml")
            .tempfile_in(&self.cfg.temp_path)
            .map_err(MountError::WriteConfig)?;
        file.write_all(text.as_bytes())
            .map_err(MountError::WriteConfig)?;

        Ok(file)
    }

    fn mount_args(&self, config_path: &Path) -> Vec<String> {
        let mut args = vec![
            "mount".to_string(),
            self.cfg.path.clone(),
            format!("--config-file={}", config_path.display()),
            format!("--tmp-path={}", self.cfg.temp_path),
            "--foreground=false".to_string(),
            "--log-level=LOG_WARNING".to_string(),
            "--use-https=true".to_string(),
        ];
        if self.cfg.allow_other {
            args.push("-o".to_string());
            args.push("allow_other".to_string());
        }
        args
    }

    async fn run_mount_tool(&self, config_path: &Path) -> Result<ExitStatus, MountError> {
        let mut cmd = Command::new(&self.cfg.blobfuse_bin);
        cmd.args(self.mount_args(config_path));
        if let Some(account_key) = &self.cfg.account_key {
            cmd.env("AZURE_STORAGE_ACCESS_KEY", account_key);
        }
        if let Some(sas_token) = &self.cfg.sas_token {
            cmd.env("AZURE_STORAGE_SAS_TOKEN", sas_token);
        }

        info!(path = %self.cfg.path, "монтируем blob-хранилище");
        cmd.status().await.map_err(|source| MountError::SpawnTool {
            tool: self.cfg.blobfuse_bin.clone(),
            source,
        })
    }
}

fn validate(cfg: &MountConfig) -> Result<(), MountError> {
    if cfg.path.trim().is_empty() {
        return Err(MountError::InvalidConfig(
            "не задан путь монтирования".to_string(),
        ));
    }
    if cfg.blobfuse_bin.trim().is_empty() {
        return Err(MountError::InvalidConfig(
            "не задан путь к бинарю blobfuse2".to_string(),
        ));
    }
    if cfg.account_name.trim().is_empty() {
        return Err(MountError::InvalidConfig(
            "не задано имя учётной записи хранилища".to_string(),
        ));
    }
    if cfg.container.trim().is_empty() {
        return Err(MountError::InvalidConfig(
            "не задан контейнер хранилища".to_string(),
        ));
    }
    if cfg.account_key.is_none() && cfg.sas_token.is_none() {
        return Err(MountError::InvalidConfig(
            "требуется ключ учётной записи или SAS-токен".to_string(),
        ));
    }
    Ok(())
}

fn create_dir(path: &str) -> Result<(), MountError> {
    std::fs::create_dir_all(path).map_err(|source| MountError::CreateDir {
        path: path.to_string(),
        source,
    })
}

pub(crate) fn is_mounted(path: &str) -> Result<bool, MountError> {
    let target = Path::new(path);
    let entries = procfs::mounts()?;
    Ok(entries
        .iter()
        .any(|entry| Path::new(&entry.fs_file) == target))
}
