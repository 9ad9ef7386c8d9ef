use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_ide_port")]
    pub ide_port: u16,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_backup_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_snapshot_base_path")]
    pub snapshot_base_path: String,
    #[serde(default = "default_true")]
    pub sync_on_activity: bool,
    #[serde(default = "default_rsync_bin")]
    pub rsync_bin: String,
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MountConfig {
    #[serde(default = "default_true")]
    pub ensure: bool,
    #[serde(default = "default_mount_path")]
    pub path: String,
    #[serde(default = "default_mount_temp_path")]
    pub temp_path: String,
    #[serde(default = "default_blobfuse_bin")]
    pub blobfuse_bin: String,
    #[serde(default)]
    pub account_name: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub account_key: Option<String>,
    #[serde(default)]
    pub sas_token: Option<String>,
    #[serde(default = "default_account_key_env")]
    pub account_key_env: String,
    #[serde(default = "default_sas_token_env")]
    pub sas_token_env: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_true")]
    pub allow_other: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub activity_endpoint: Option<String>,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_report_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_http_listen(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_backup_interval_secs(),
            snapshot_base_path: default_snapshot_base_path(),
            sync_on_activity: true,
            rsync_bin: default_rsync_bin(),
            excludes: default_excludes(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            ensure: true,
            path: default_mount_path(),
            temp_path: default_mount_temp_path(),
            blobfuse_bin: default_blobfuse_bin(),
            account_name: String::new(),
            container: String::new(),
            account_key: None,
            sas_token: None,
            account_key_env: default_account_key_env(),
            sas_token_env: default_sas_token_env(),
            endpoint: None,
            allow_other: true,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            activity_endpoint: None,
            environment_id: None,
            api_key: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_report_timeout_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workspace_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле workspace_dir обязательно".to_string(),
            ));
        }
        if self.monitor_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "monitor_interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.ide_port == 0 || self.ssh_port == 0 {
            return Err(ConfigError::Validation(
                "ide_port и ssh_port должны быть в диапазоне 1..65535".to_string(),
            ));
        }
        if self.ide_port == self.ssh_port {
            return Err(ConfigError::Validation(
                "ide_port и ssh_port не должны совпадать".to_string(),
            ));
        }

        if self.http.enabled {
            if self.http.listen.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "поле http.listen обязательно".to_string(),
                ));
            }
            if SocketAddr::from_str(&self.http.listen).is_err() {
                return Err(ConfigError::Validation(
                    "поле http.listen должно быть корректным адресом host:port".to_string(),
                ));
            }
        }

        if self.backup.enabled {
            if self.backup.interval_secs < 1 {
                return Err(ConfigError::Validation(
                    "backup.interval_secs должно быть >= 1".to_string(),
                ));
            }
            if self.backup.snapshot_base_path.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "backup.snapshot_base_path не должен быть пустым".to_string(),
                ));
            }
            if self.mount.path.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "mount.path обязателен при включённом резервном копировании".to_string(),
                ));
            }
        }

        if self.report.enabled {
            let environment_id = self
                .report
                .environment_id
                .as_deref()
                .map(str::trim)
                .unwrap_or_default();
            if environment_id.is_empty() {
                return Err(ConfigError::Validation(
                    "report.environment_id обязателен при включённых отчётах".to_string(),
                ));
            }

            let has_endpoint = self
                .report
                .activity_endpoint
                .as_deref()
                .map(str::trim)
                .is_some_and(|v| !v.is_empty());
            let has_base_url = self
                .report
                .base_url
                .as_deref()
                .map(str::trim)
                .is_some_and(|v| !v.is_empty());
            if !has_endpoint && !has_base_url {
                return Err(ConfigError::Validation(
                    "задайте report.base_url или report.activity_endpoint".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }

    pub fn mount_credentials_summary(&self) -> String {
        if self.mount.account_name.is_empty() && self.mount.container.is_empty() {
            return "mount-disabled".to_string();
        }
        format!(
            "account={} container={} key={} sas={}",
            self.mount.account_name,
            self.mount.container,
            mask_value(self.mount.account_key.as_deref()),
            mask_value(self.mount.sas_token.as_deref()),
        )
    }
}

impl BackupConfig {
    pub fn cleaned_excludes(&self) -> Vec<String> {
        self.excludes
            .iter()
            .map(|pattern| pattern.trim().to_string())
            .filter(|pattern| !pattern.is_empty())
            .collect()
    }
}

fn mask_value(value: Option<&str>) -> String {
    match value {
        None => "<empty>".to_string(),
        Some(v) if v.is_empty() => "<empty>".to_string(),
        Some(v) if v.len() <= 6 => "***".to_string(),
        Some(v) => format!("{}***{}", &v[..3], &v[v.len() - 3..]),
    }
}

const fn default_true() -> bool {
    true
}

fn default_workspace_dir() -> String {
    "/workspace".to_string()
}

const fn default_monitor_interval_secs() -> u64 {
    30
}

const fn default_ide_port() -> u16 {
    8080
}

const fn default_ssh_port() -> u16 {
    2222
}

fn default_http_listen() -> String {
    "127.0.0.1:9000".to_string()
}

const fn default_backup_interval_secs() -> u64 {
    900
}

fn default_snapshot_base_path() -> String {
    "snapshots".to_string()
}

fn default_rsync_bin() -> String {
    "rsync".to_string()
}

fn default_excludes() -> Vec<String> {
    vec![".cache".to_string(), ".git/node_modules".to_string()]
}

fn default_mount_path() -> String {
    "/mnt/azureblob".to_string()
}

fn default_mount_temp_path() -> String {
    "/tmp/blobfuse2".to_string()
}

fn default_blobfuse_bin() -> String {
    "blobfuse2".to_string()
}

fn default_account_key_env() -> String {
    "AZURE_BLOB_ACCOUNT_KEY".to_string()
}

fn default_sas_token_env() -> String {
    "AZURE_BLOB_SAS_TOKEN".to_string()
}

fn default_api_key_env() -> String {
    "WORKSPACED_REPORT_API_KEY".to_string()
}

const fn default_report_timeout_secs() -> u64 {
    5
}
