use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of scan work a task performs.
///
/// Each type maps to exactly one registered executor and one dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SubdomainEnum,
    PortScan,
    VulnScan,
    AssetDiscovery,
    DirScan,
    WebCrawl,
    SensitiveScan,
    PageMonitor,
}

impl TaskType {
    /// All known task types, in a stable order.
    pub const ALL: [TaskType; 8] = [
        Self::SubdomainEnum,
        Self::PortScan,
        Self::VulnScan,
        Self::AssetDiscovery,
        Self::DirScan,
        Self::WebCrawl,
        Self::SensitiveScan,
        Self::PageMonitor,
    ];
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SubdomainEnum => "subdomain_enum",
            Self::PortScan => "port_scan",
            Self::VulnScan => "vuln_scan",
            Self::AssetDiscovery => "asset_discovery",
            Self::DirScan => "dir_scan",
            Self::WebCrawl => "web_crawl",
            Self::SensitiveScan => "sensitive_scan",
            Self::PageMonitor => "page_monitor",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subdomain_enum" => Ok(Self::SubdomainEnum),
            "port_scan" => Ok(Self::PortScan),
            "vuln_scan" => Ok(Self::VulnScan),
            "asset_discovery" => Ok(Self::AssetDiscovery),
            "dir_scan" => Ok(Self::DirScan),
            "web_crawl" => Ok(Self::WebCrawl),
            "sensitive_scan" => Ok(Self::SensitiveScan),
            "page_monitor" => Ok(Self::PageMonitor),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
///
/// The orchestrator enforces the transition graph; see the state machine in
/// `dragnet-core`. `Completed`, `Failed`, `Cancelled`, and `Timeout` are
/// terminal: once observed, no later observation returns a non-terminal
/// status for the same task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    /// Whether this status is terminal (no further automatic transitions).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Scheduling priority of a task.
///
/// Ordered: `Low < Normal < High < Critical`. High and critical tasks get
/// an amplified resource penalty during node selection so they land on
/// less-stressed nodes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric level (low=1 .. critical=4).
    pub fn level(self) -> i32 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] string.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// Kind of a recorded task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskQueued,
    TaskAssigned,
    TaskAdmitted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskRetryScheduled,
    TaskCancelled,
    TaskTimeout,
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskQueued => "task_queued",
            Self::TaskAssigned => "task_assigned",
            Self::TaskAdmitted => "task_admitted",
            Self::TaskProgress => "task_progress",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskRetryScheduled => "task_retry_scheduled",
            Self::TaskCancelled => "task_cancelled",
            Self::TaskTimeout => "task_timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskEventKind {
    type Err = TaskEventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_queued" => Ok(Self::TaskQueued),
            "task_assigned" => Ok(Self::TaskAssigned),
            "task_admitted" => Ok(Self::TaskAdmitted),
            "task_progress" => Ok(Self::TaskProgress),
            "task_completed" => Ok(Self::TaskCompleted),
            "task_failed" => Ok(Self::TaskFailed),
            "task_retry_scheduled" => Ok(Self::TaskRetryScheduled),
            "task_cancelled" => Ok(Self::TaskCancelled),
            "task_timeout" => Ok(Self::TaskTimeout),
            other => Err(TaskEventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskEventKind`] string.
#[derive(Debug, Clone)]
pub struct TaskEventKindParseError(pub String);

impl fmt::Display for TaskEventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task event kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskEventKindParseError {}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A task -- one unit of scan work flowing through the control plane.
///
/// Invariants maintained by the orchestrator:
/// - `node_id` is set exactly while the task is `Running`.
/// - `completed_at` is set exactly when the status is terminal.
/// - `retry_count <= max_retries` at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Executor-specific configuration, validated at submit time.
    pub config: Map<String, Value>,
    /// Tasks that must reach `Completed` (with a persisted result) before
    /// this one may dispatch.
    pub depends_on: Vec<Uuid>,
    pub project_id: Option<String>,
    /// Worker node the task is currently dispatched to.
    pub node_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Wall-clock budget in seconds; `0` means "engine default".
    pub timeout_secs: u64,
    /// Completion estimate, 0-100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// External URL to POST the final task summary to, best effort.
    pub callback_url: Option<String>,
    pub result_id: Option<Uuid>,
}

impl Task {
    /// Build a fresh `Pending` task with defaults for everything the caller
    /// does not set explicitly.
    pub fn new(name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_type,
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            config: Map::new(),
            depends_on: Vec::new(),
            project_id: None,
            node_id: None,
            retry_count: 0,
            max_retries: 0,
            timeout_secs: 0,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            callback_url: None,
            result_id: None,
        }
    }
}

/// Result payload produced by an executor for one task.
///
/// At most one result exists per task id; the store rejects duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Terminal status the task reached when this result was produced.
    pub status: TaskStatus,
    pub data: Map<String, Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task_id: Uuid, data: Map<String, Value>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            status: TaskStatus::Completed,
            data,
            error: None,
            started_at,
            ended_at: Utc::now(),
        }
    }

    pub fn failure(
        task_id: Uuid,
        status: TaskStatus,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            status,
            data: Map::new(),
            error: Some(error.into()),
            started_at,
            ended_at: Utc::now(),
        }
    }
}

/// Durable descriptor of a named dispatch queue.
///
/// The queue's member list is stored separately under `task_queue:<name>`;
/// `count` mirrors its length and is maintained with relative updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    pub name: String,
    pub task_type: TaskType,
    /// Static arbitration priority; higher drains first.
    pub priority: i32,
    /// Maximum queued tasks; `0` means unbounded.
    pub max_size: usize,
    pub count: usize,
}

/// A cron schedule rule that materializes tasks from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub id: Uuid,
    pub name: String,
    pub cron_expr: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    pub enabled: bool,
    /// Task whose type/config/priority are cloned for each fire.
    pub template_id: Uuid,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    /// When set, the rule auto-disables once `run_count` reaches it.
    pub max_runs: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// An event recorded on a task's lifecycle stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: TaskEventKind,
    pub message: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(task_id: Uuid, kind: TaskEventKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            kind,
            message: message.into(),
            payload: Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_display_roundtrip() {
        for v in &TaskType::ALL {
            let s = v.to_string();
            let parsed: TaskType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_type_invalid() {
        let result = "warp_scan".parse::<TaskType>();
        assert!(result.is_err());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "paused".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn priority_ordering_and_levels() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Critical);
        assert_eq!(TaskPriority::Low.level(), 1);
        assert_eq!(TaskPriority::Critical.level(), 4);
    }

    #[test]
    fn priority_display_roundtrip() {
        let variants = [
            TaskPriority::Low,
            TaskPriority::Normal,
            TaskPriority::High,
            TaskPriority::Critical,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskPriority = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_kind_display_roundtrip() {
        let variants = [
            TaskEventKind::TaskQueued,
            TaskEventKind::TaskAssigned,
            TaskEventKind::TaskAdmitted,
            TaskEventKind::TaskProgress,
            TaskEventKind::TaskCompleted,
            TaskEventKind::TaskFailed,
            TaskEventKind::TaskRetryScheduled,
            TaskEventKind::TaskCancelled,
            TaskEventKind::TaskTimeout,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskEventKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new("probe", TaskType::PortScan);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.progress, 0);
        assert!(task.node_id.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn task_serde_roundtrip() {
        let mut task = Task::new("probe", TaskType::VulnScan);
        task.config
            .insert("target".to_string(), Value::String("10.0.0.1".into()));
        let json = serde_json::to_string(&task).expect("serialize");
        let back: Task = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.id, task.id);
        assert_eq!(back.task_type, TaskType::VulnScan);
        assert_eq!(back.config["target"], Value::String("10.0.0.1".into()));
    }
}
