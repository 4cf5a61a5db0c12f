#![forbid(unsafe_code)]

use crate::clock::ts_ms_to_rfc3339;
use crate::error::OrchestratorError;
use bf_core::manifest::JobResultSummary;
use bf_core::{JobId, JobStatus};
use bf_storage::{JobEventRow, JobRecord, JobsListRequest, SqliteStore};
use serde::Serialize;
use serde_json::{Value, json};

const EVENT_TRAIL_LIMIT: usize = 200;

/// Read-only rendering of a job record for external consumers.
#[derive(Clone, Debug, Serialize)]
pub struct StatusView {
    pub job_id: String,
    pub revision: i64,
    pub input_reference: String,
    pub input_name: String,
    pub status: JobStatus,
    pub compute_handle: Option<String>,
    pub created_at_ms: i64,
    pub created_at: String,
    pub updated_at_ms: i64,
    pub updated_at: String,
    pub completed_at_ms: Option<i64>,
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<JobResultSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Value>>,
}

impl StatusView {
    pub fn from_record(job: JobRecord) -> Self {
        // A summary that no longer parses is still shown, just without structure.
        let result_summary = job
            .result_summary_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        Self {
            job_id: job.job_id.into_string(),
            revision: job.revision,
            input_reference: job.input_reference,
            input_name: job.input_name,
            status: job.status,
            compute_handle: job.compute_handle.map(|h| h.as_str().to_string()),
            created_at_ms: job.created_at_ms,
            created_at: ts_ms_to_rfc3339(job.created_at_ms),
            updated_at_ms: job.updated_at_ms,
            updated_at: ts_ms_to_rfc3339(job.updated_at_ms),
            completed_at_ms: job.completed_at_ms,
            completed_at: job.completed_at_ms.map(ts_ms_to_rfc3339),
            failure_reason: job.failure_reason,
            failure_detail: job.failure_detail,
            result_summary,
            events: None,
        }
    }
}

pub fn event_to_json(event: JobEventRow) -> Value {
    let event_ref = event.event_id();
    let mut out = json!({
        "seq": event.seq,
        "ref": event_ref,
        "ts_ms": event.ts_ms,
        "ts": ts_ms_to_rfc3339(event.ts_ms),
        "kind": event.kind,
        "from": event.from_status,
        "to": event.to_status,
        "message": event.message
    });
    if let Some(meta_json) = event.meta_json.as_deref()
        && let Ok(meta) = serde_json::from_str::<Value>(meta_json)
        && let Some(obj) = out.as_object_mut()
    {
        obj.insert("meta".to_string(), meta);
    }
    out
}

pub fn get(
    store: &SqliteStore,
    job_id: &JobId,
    with_events: bool,
) -> Result<Option<StatusView>, OrchestratorError> {
    let Some(job) = store.get(job_id)? else {
        return Ok(None);
    };
    let mut view = StatusView::from_record(job);
    if with_events {
        let events = store.job_events(job_id, EVENT_TRAIL_LIMIT)?;
        view.events = Some(events.into_iter().map(event_to_json).collect());
    }
    Ok(Some(view))
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusPage {
    pub jobs: Vec<StatusView>,
    pub has_more: bool,
    pub next_offset: Option<usize>,
}

pub fn list(
    store: &SqliteStore,
    status: Option<JobStatus>,
    limit: usize,
    offset: usize,
) -> Result<StatusPage, OrchestratorError> {
    let page = store.list(JobsListRequest {
        status,
        limit,
        offset,
    })?;
    let next_offset = page.has_more.then(|| offset + page.jobs.len());
    Ok(StatusPage {
        jobs: page.jobs.into_iter().map(StatusView::from_record).collect(),
        has_more: page.has_more,
        next_offset,
    })
}

/// Record count per status, as a JSON object.
pub fn counts(store: &SqliteStore) -> Result<Value, OrchestratorError> {
    let mut by_status = serde_json::Map::new();
    let mut total = 0i64;
    for row in store.status_counts()? {
        total += row.count;
        by_status.insert(row.status, json!(row.count));
    }
    Ok(json!({
        "total": total,
        "by_status": by_status
    }))
}
