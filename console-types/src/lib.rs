//! Wire contract between the job API server and the console pipeline
//!
//! These types are used by both:
//! - the streaming pipeline (`console-stream`, native or WASM)
//! - the TypeScript view layer (via generated bindings)
//!
//! Serializable with serde for JSON over WebSocket/HTTP

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Job Status
// ============================================================================

/// Lifecycle status of a backup job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "../../ts/generated.ts")]
pub enum JobStatus {
    New,
    Pending,
    Waiting,
    Running,
    Successful,
    Failed,
    Error,
    Canceled,
}

impl JobStatus {
    /// True once the job can no longer produce output.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Error | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Pending => "pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }
}

// ============================================================================
// Job Events
// ============================================================================

/// JobEvent - one captured event of a job's output stream
///
/// Delivered both by the paginated REST collection and by live socket push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../ts/generated.ts")]
pub struct JobEvent {
    /// Database id of the event row
    pub id: i64,

    /// Global sequence number within the job (strictly increasing in
    /// generation order, may arrive out of order across REST/socket)
    pub counter: u64,

    /// Event kind, e.g. "playbook_on_task_start" or "runner_on_ok".
    /// REST payloads name this field `event`; socket frames `event_name`.
    #[serde(alias = "event")]
    pub event_name: String,

    /// Id of the owning job (absent on some REST detail payloads)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<i64>,

    /// First stdout line index covered by this event (0-based, exclusive
    /// of the line itself: the first rendered line is `start_line + 1`)
    #[serde(default)]
    pub start_line: u64,

    /// Last stdout line index covered by this event (0-based)
    #[serde(default)]
    pub end_line: u64,

    /// Captured output blob, CRLF-separated, with ANSI-ish style codes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// When the event was produced
    pub created: DateTime<Utc>,

    /// Event-specific payload (host results, play/task uuids, stats)
    #[serde(default)]
    #[ts(type = "unknown")]
    pub event_data: serde_json::Value,
}

impl JobEvent {
    /// Fold-group uuid for structural events, from `event_data`.
    pub fn play_uuid(&self) -> Option<&str> {
        self.event_data.get("play_uuid").and_then(|v| v.as_str())
    }

    pub fn task_uuid(&self) -> Option<&str> {
        self.event_data.get("task_uuid").and_then(|v| v.as_str())
    }
}

/// One page of a paginated job-event collection (DRF envelope).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../ts/generated.ts")]
pub struct EventPage {
    /// Total number of results across all pages
    pub count: u64,

    /// Absolute URL of the next page, if any
    pub next: Option<String>,

    pub previous: Option<String>,

    pub results: Vec<JobEvent>,
}

// ============================================================================
// Job Summary
// ============================================================================

/// Summary/status record of one job, as returned by `GET {jobs_base}/{id}/`.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../ts/generated.ts")]
pub struct JobSummary {
    pub id: i64,
    pub name: String,
    pub status: JobStatus,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Server-computed duration in seconds; drifts during streaming and is
    /// reconciled by a final refetch at terminal status
    #[serde(default)]
    pub elapsed: f64,
    /// Human-readable reason when the job never ran or was stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_explanation: Option<String>,
}

/// Body of `GET {jobs_base}/{id}/cancel/` - cancel eligibility probe.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../ts/generated.ts")]
pub struct CancelCheck {
    pub can_cancel: bool,
}

// ============================================================================
// Socket Protocol
// ============================================================================

/// Inbound socket frame, discriminated by `group_name`.
///
/// Unknown groups fail to parse and are dropped by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "group_name", rename_all = "snake_case")]
pub enum SocketFrame {
    /// Job status notifications. A frame without `status` signals that the
    /// job's summary data is complete and dashboards should refresh.
    Jobs {
        job_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<JobStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
    },

    /// One live job event, same shape as the REST representation.
    JobEvents(JobEvent),

    /// Session control directive; receipt forces session termination.
    Control {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Outbound subscription envelope: `{"groups": {<channel>: [<filters>]}}`.
///
/// The server replaces the connection's entire group set on every envelope,
/// so sending an empty one unsubscribes from everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub groups: BTreeMap<String, Vec<serde_json::Value>>,
}

impl Subscription {
    /// Everything the job detail view listens on: status transitions and
    /// summary completion for all jobs, plus the event stream of one job.
    pub fn job_detail(job_id: i64) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            "jobs".to_string(),
            vec![
                serde_json::Value::from("status_changed"),
                serde_json::Value::from("summary"),
            ],
        );
        groups.insert("job_events".to_string(), vec![serde_json::Value::from(job_id)]);
        Self { groups }
    }

    /// Empty envelope - unsubscribes from all groups.
    pub fn none() -> Self {
        Self::default()
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Structural event kinds (headers/recaps): loaded first as the skeleton,
/// excluded from detail/backlog queries.
pub const EVENT_PLAYBOOK_START: &str = "playbook_on_start";
pub const EVENT_PLAY_START: &str = "playbook_on_play_start";
pub const EVENT_TASK_START: &str = "playbook_on_task_start";
pub const EVENT_STATS: &str = "playbook_on_stats";

/// Runner (per-host) event kinds.
pub const EVENT_RUNNER_OK: &str = "runner_on_ok";
pub const EVENT_RUNNER_FAILED: &str = "runner_on_failed";
pub const EVENT_RUNNER_UNREACHABLE: &str = "runner_on_unreachable";
pub const EVENT_RUNNER_SKIPPED: &str = "runner_on_skipped";
pub const EVENT_RUNNER_ASYNC_OK: &str = "runner_on_async_ok";

pub const STRUCTURAL_EVENT_KINDS: [&str; 4] = [
    EVENT_PLAYBOOK_START,
    EVENT_PLAY_START,
    EVENT_TASK_START,
    EVENT_STATS,
];

// ============================================================================
// Tests
// ============================================================================
