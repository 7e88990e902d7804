//! Best-effort HTTP callback on task completion.
//!
//! When a task carries a `callback_url`, its final summary is POSTed
//! there: 3 attempts with exponential backoff, failures logged and
//! swallowed. The caller spawns this so task finalization never blocks on
//! a slow callback endpoint.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use dragnet_store::{Task, TaskResult, TaskStatus, TaskType};

const ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Final task summary delivered to the callback URL.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub data: Option<Map<String, Value>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSummary {
    pub fn from_task(task: &Task, result: Option<&TaskResult>) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            task_type: task.task_type,
            status: task.status,
            progress: task.progress,
            error: result.and_then(|r| r.error.clone()),
            data: result.map(|r| r.data.clone()),
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

/// POST the summary with bounded retries. Returns whether any attempt
/// succeeded; the caller only logs the answer.
pub async fn post_summary(client: &reqwest::Client, url: &str, summary: &TaskSummary) -> bool {
    for attempt in 0..ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt - 1)).await;
        }
        match client.post(url).json(summary).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(task_id = %summary.task_id, url, "callback delivered");
                return true;
            }
            Ok(response) => {
                warn!(
                    task_id = %summary.task_id,
                    url,
                    status = %response.status(),
                    attempt = attempt + 1,
                    "callback rejected"
                );
            }
            Err(e) => {
                warn!(
                    task_id = %summary.task_id,
                    url,
                    error = %e,
                    attempt = attempt + 1,
                    "callback failed"
                );
            }
        }
    }
    warn!(task_id = %summary.task_id, url, "callback abandoned after {ATTEMPTS} attempts");
    false
}
