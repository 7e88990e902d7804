//! Thin HTTP client for the admin API, used by the CLI subcommands.

use anyhow::{Context, Result, bail};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use dragnet_core::cron::{NewScheduleRule, ScheduleRuleUpdate};
use dragnet_core::dispatch::NewTask;

pub struct AdminClient {
    base: String,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(server: &str) -> Self {
        Self {
            base: server.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        let bytes = response.bytes().await.context("failed to read response")?;
        if !status.is_success() {
            let message = serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_owned))
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            bail!("{url}: {status}: {message}");
        }
        if bytes.is_empty() || status == StatusCode::NO_CONTENT || status == StatusCode::ACCEPTED {
            // Some endpoints return no body; give the caller a null.
            return serde_json::from_value(Value::Null).context("empty response");
        }
        serde_json::from_slice(&bytes).context("failed to decode response")
    }

    pub async fn submit(&self, new_task: NewTask) -> Result<Value> {
        self.call(
            Method::POST,
            "/api/tasks",
            Some(serde_json::to_value(new_task)?),
        )
        .await
    }

    pub async fn task(&self, id: Uuid) -> Result<Value> {
        self.call(Method::GET, &format!("/api/tasks/{id}"), None).await
    }

    pub async fn progress(&self, id: Uuid) -> Result<Value> {
        self.call(Method::GET, &format!("/api/tasks/{id}/progress"), None)
            .await
    }

    pub async fn events(&self, id: Uuid) -> Result<Value> {
        self.call(Method::GET, &format!("/api/tasks/{id}/events"), None)
            .await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Value> {
        self.call(Method::POST, &format!("/api/tasks/{id}/cancel"), None)
            .await
    }

    pub async fn resubmit(&self, id: Uuid) -> Result<Value> {
        self.call(Method::POST, &format!("/api/tasks/{id}/resubmit"), None)
            .await
    }

    pub async fn running(&self) -> Result<Value> {
        self.call(Method::GET, "/api/running", None).await
    }

    pub async fn queues(&self) -> Result<Value> {
        self.call(Method::GET, "/api/queues", None).await
    }

    pub async fn nodes(&self) -> Result<Value> {
        self.call(Method::GET, "/api/nodes", None).await
    }

    pub async fn create_schedule(&self, rule: NewScheduleRule) -> Result<Value> {
        self.call(
            Method::POST,
            "/api/schedules",
            Some(serde_json::to_value(rule)?),
        )
        .await
    }

    pub async fn list_schedules(&self) -> Result<Value> {
        self.call(Method::GET, "/api/schedules", None).await
    }

    pub async fn schedule_stats(&self) -> Result<Value> {
        self.call(Method::GET, "/api/schedules/stats", None).await
    }

    pub async fn update_schedule(&self, id: Uuid, update: ScheduleRuleUpdate) -> Result<Value> {
        self.call(
            Method::PUT,
            &format!("/api/schedules/{id}"),
            Some(serde_json::to_value(update)?),
        )
        .await
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<Value> {
        self.call(Method::DELETE, &format!("/api/schedules/{id}"), None)
            .await
    }

    pub async fn trigger_schedule(&self, id: Uuid) -> Result<Value> {
        self.call(Method::POST, &format!("/api/schedules/{id}/trigger"), None)
            .await
    }
}
