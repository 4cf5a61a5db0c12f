#![forbid(unsafe_code)]

use bf_core::{ComputeHandle, JobId, JobStatus};

#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub revision: i64,
    pub input_reference: String,
    pub input_name: String,
    pub status: JobStatus,
    pub compute_handle: Option<ComputeHandle>,
    pub failure_reason: Option<String>,
    pub failure_detail: Option<String>,
    pub result_summary_json: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobEventRow {
    pub seq: i64,
    pub job_id: String,
    pub ts_ms: i64,
    pub kind: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub message: String,
    pub meta_json: Option<String>,
}

impl JobEventRow {
    pub fn event_id(&self) -> String {
        format!("{}@{}", self.job_id, self.seq)
    }
}

#[derive(Clone, Debug)]
pub struct JobCreateRequest {
    pub job_id: JobId,
    pub input_reference: String,
    pub input_name: String,
    pub now_ms: i64,
}

#[derive(Clone, Debug)]
pub struct JobCreateResult {
    pub job: JobRecord,
    /// False when the record already existed; nothing was written.
    pub created: bool,
}

/// Extra columns written alongside a status change.
#[derive(Clone, Debug, Default)]
pub struct TransitionFields {
    pub compute_handle: Option<ComputeHandle>,
    pub failure_reason: Option<String>,
    pub failure_detail: Option<String>,
    pub result_summary_json: Option<String>,
}

#[derive(Clone, Debug)]
pub struct JobTransitionRequest {
    pub job_id: JobId,
    pub expected: Vec<JobStatus>,
    pub new_status: JobStatus,
    pub fields: TransitionFields,
    pub now_ms: i64,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum TransitionOutcome {
    Applied { job: JobRecord, event: JobEventRow },
    /// Current status was not in the expected set; nothing was written.
    Rejected { current: JobRecord },
}

impl TransitionOutcome {
    pub fn job(&self) -> &JobRecord {
        match self {
            Self::Applied { job, .. } => job,
            Self::Rejected { current } => current,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Clone, Debug)]
pub struct JobsListRequest {
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Clone, Debug)]
pub struct JobsListResult {
    pub jobs: Vec<JobRecord>,
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}
