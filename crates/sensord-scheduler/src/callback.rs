use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sensord_core::CallbackConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Result, SchedulerError},
    types::{TaskResult, TaskStatus},
};

/// JSON body POSTed to an entry's `callback_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    /// Where this result can be fetched from.
    pub url: String,
    /// URL of the owning schedule entry.
    pub schedule_entry: String,
    pub task_id: i64,
    pub started: String,
    pub finished: String,
    pub duration: f64,
    pub result: TaskStatus,
    pub detail: String,
}

impl CallbackPayload {
    pub fn from_result(result: &TaskResult, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            url: format!(
                "{base}/tasks/completed/{}/{}",
                result.schedule_entry, result.task_id
            ),
            schedule_entry: format!("{base}/schedule/{}", result.schedule_entry),
            task_id: result.task_id,
            started: iso_millis(&result.started),
            finished: iso_millis(&result.finished),
            duration: result.duration,
            result: result.status,
            detail: result.detail.clone(),
        }
    }
}

fn iso_millis(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Delivers task results to callback receivers.
///
/// A single attempt; the scheduler records a failed delivery as
/// `notification_failed` and never retries.
#[async_trait]
pub trait ResultNotifier: Send + Sync {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<()>;
}

/// [`ResultNotifier`] over HTTPS with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpNotifier {
    pub fn new(config: &CallbackConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_ssl);

        if let Some(path) = config.ca_cert_path.as_deref().filter(|p| !p.is_empty()) {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| SchedulerError::Callback(format!("invalid CA certificate {path}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| SchedulerError::Callback(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            auth_token: config.auth_token.clone().filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl ResultNotifier for HttpNotifier {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<()> {
        let mut request = self.client.post(url).json(payload);
        if let Some(token) = &self.auth_token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Token {token}"));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SchedulerError::Callback(format!("POST {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SchedulerError::Callback(format!("POST {url}: HTTP {status}")));
        }
        debug!(%url, %status, "callback delivered");
        Ok(())
    }
}
