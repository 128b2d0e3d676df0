//! Thin HTTP client for the runtime-action subcommands (`trigger`,
//! `cancel`, `schedule status|enable|disable`) against a running
//! `xfer serve` daemon.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub transfer_type: String,
    pub linked_group: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerResult {
    pub task_id: Uuid,
    pub success: bool,
    pub rows: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub errors: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelResult {
    pub task_id: Uuid,
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub active: bool,
    pub running: bool,
    pub hour: Option<String>,
    pub next_execution: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
}

/// Client for one running `xfer serve` instance, addressed by base URL
/// (e.g. `http://127.0.0.1:8765`).
pub struct ServeClient {
    base_url: String,
    http: reqwest::Client,
}

impl ServeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        let url = format!("{}/api/tasks", self.base_url);
        self.get(&url).await
    }

    pub async fn trigger(&self, task_id: Uuid) -> Result<TriggerResult> {
        let url = format!("{}/api/tasks/{task_id}/trigger", self.base_url);
        self.post(&url).await
    }

    pub async fn cancel(&self, task_id: Uuid) -> Result<CancelResult> {
        let url = format!("{}/api/tasks/{task_id}/cancel", self.base_url);
        self.post(&url).await
    }

    pub async fn schedule_status(&self) -> Result<ScheduleStatus> {
        let url = format!("{}/api/schedule", self.base_url);
        self.get(&url).await
    }

    pub async fn schedule_enable(&self, hour: &str) -> Result<ScheduleStatus> {
        let url = format!("{}/api/schedule/enable", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "hour": hour }))
            .send()
            .await
            .with_context(|| format!("failed to reach xfer serve at {url}"))?;
        Self::decode(response).await
    }

    pub async fn schedule_disable(&self) -> Result<ScheduleStatus> {
        let url = format!("{}/api/schedule/disable", self.base_url);
        self.post(&url).await
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to reach xfer serve at {url}"))?;
        Self::decode(response).await
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .post(url)
            .send()
            .await
            .with_context(|| format!("failed to reach xfer serve at {url}"))?;
        Self::decode(response).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .context("failed to read xfer serve response body")?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiError>(&bytes)
                .map(|e| e.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).to_string());
            bail!("xfer serve returned {status}: {message}");
        }

        serde_json::from_slice(&bytes).context("failed to parse xfer serve response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_formats_task_trigger_url() {
        let client = ServeClient::new("http://127.0.0.1:8765");
        let task_id = Uuid::nil();
        let url = format!("{}/api/tasks/{task_id}/trigger", client.base_url);
        assert_eq!(url, "http://127.0.0.1:8765/api/tasks/00000000-0000-0000-0000-000000000000/trigger");
    }
}
