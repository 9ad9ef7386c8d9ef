use crate::config::ReportConfig;
use crate::state::ActivitySnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, snapshot: &ActivitySnapshot) -> Result<(), ReportError>;
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("некорректная конфигурация отчётов: {0}")]
    InvalidConfig(String),
    #[error("не удалось отправить отчёт об активности: {0}")]
    Http(#[from] reqwest::Error),
    #[error("эндпоинт активности ответил статусом {0}")]
    UnexpectedStatus(StatusCode),
}

#[derive(Debug)]
pub struct HttpReporter {
    client: Client,
    endpoint: String,
    environment_id: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ActivityReport<'a> {
    #[serde(rename = "environmentId")]
    environment_id: &'a str,
    snapshot: &'a ActivitySnapshot,
    timestamp: DateTime<Utc>,
}

impl HttpReporter {
    pub fn new(cfg: &ReportConfig) -> Result<Self, ReportError> {
        let environment_id = cfg
            .environment_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ReportError::InvalidConfig("не задан идентификатор окружения".to_string())
            })?
            .to_string();

        let endpoint = resolve_endpoint(cfg, &environment_id)?;

        let timeout = if cfg.timeout_secs == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_secs(cfg.timeout_secs)
        };

        let client = Client::builder()
            .user_agent("workspaced/0.1.0")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            environment_id,
            api_key: cfg.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn resolve_endpoint(cfg: &ReportConfig, environment_id: &str) -> Result<String, ReportError> {
    if let Some(endpoint) = cfg
        .activity_endpoint
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Ok(endpoint.to_string());
    }

    let base = cfg
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ReportError::InvalidConfig(
                "не задан базовый адрес сервиса или явный эндпоинт активности".to_string(),
            )
        })?;

    Ok(format!(
        "{}/api/v1/environments/{}/activity",
        base.trim_end_matches('/'),
        environment_id
    ))
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report(&self, snapshot: &ActivitySnapshot) -> Result<(), ReportError> {
        let body = ActivityReport {
            environment_id: &self.environment_id,
            snapshot,
            timestamp: Utc::now(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ReportError::UnexpectedStatus(response.status()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_cfg() -> ReportConfig {
        ReportConfig {
            enabled: true,
            base_url: Some("https://api.example.com/".to_string()),
            activity_endpoint: None,
            environment_id: Some("env-42".to_string()),
            api_key: None,
            api_key_env: "WORKSPACED_REPORT_API_KEY".to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn endpoint_derived_from_base_url() {
        let reporter = HttpReporter::new(&report_cfg()).expect("создание репортёра");
        assert_eq!(
            reporter.endpoint(),
            "https://api.example.com/api/v1/environments/env-42/activity"
        );
    }

    #[test]
    fn explicit_endpoint_wins_over_base_url() {
        let mut cfg = report_cfg();
        cfg.activity_endpoint = Some("https://other.example.com/activity".to_string());

        let reporter = HttpReporter::new(&cfg).expect("создание репортёра");
        assert_eq!(reporter.endpoint(), "https://other.example.com/activity");
    }

    #[test]
    fn missing_environment_id_is_rejected() {
        let mut cfg = report_cfg();
        cfg.environment_id = None;

        let err = HttpReporter::new(&cfg).expect_err("должна быть ошибка конфигурации");
        assert!(matches!(err, ReportError::InvalidConfig(_)));
    }

    #[test]
    fn missing_base_url_and_endpoint_is_rejected() {
        let mut cfg = report_cfg();
        cfg.base_url = None;

        let err = HttpReporter::new(&cfg).expect_err("должна быть ошибка конфигурации");
        assert!(matches!(err, ReportError::InvalidConfig(_)));
    }

    #[test]
    fn payload_serializes_wire_field_names() {
        let snapshot = ActivitySnapshot {
            last_ide_activity: Some(Utc::now()),
            last_ssh_activity: None,
            active_ide: 1,
            active_ssh: 0,
        };
        let body = ActivityReport {
            environment_id: "env-42",
            snapshot: &snapshot,
            timestamp: Utc::now(),
        };

        let value = serde_json::to_value(&body).expect("сериализация отчёта");
        assert_eq!(value["environmentId"], "env-42");
        assert!(value.get("timestamp").is_some());
        assert_eq!(value["snapshot"]["activeIDEConnections"], 1);
    }
}
