#![forbid(unsafe_code)]

use crate::ids::JobId;
use crate::model::StageId;
use serde::{Deserialize, Serialize};

/// "New object" notification from the object store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactNotification {
    pub storage_key: String,
    #[serde(default)]
    pub event_time: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionParameters {
    pub input_reference: String,
    pub output_prefix: String,
    pub input_name: String,
}

/// Request sent to the compute backend.
///
/// `client_token` equals the job id so backends that deduplicate on a
/// caller token collapse retried submissions into one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputeSubmission {
    pub job_id: String,
    pub container_reference: String,
    pub parameters: SubmissionParameters,
    pub client_token: String,
}

impl ComputeSubmission {
    pub fn new(job_id: &JobId, container_reference: &str, parameters: SubmissionParameters) -> Self {
        Self {
            job_id: job_id.as_str().to_string(),
            container_reference: container_reference.to_string(),
            parameters,
            client_token: job_id.as_str().to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputeCompletionSignal {
    pub compute_handle: String,
    #[serde(default)]
    pub job_id: Option<String>,
    pub terminal: bool,
    #[serde(default)]
    pub stage: Option<u8>,
    pub success: bool,
    #[serde(default)]
    pub output_references: Vec<String>,
    #[serde(default)]
    pub error_classification: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// What a completion signal asks the reconciler to do.
#[derive(Clone, Debug, PartialEq)]
pub enum SignalKind {
    StageCompleted(StageId),
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalError {
    EmptyHandle,
    MissingStage,
    StageOutOfRange { stage: u8, stage_count: u8 },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyHandle => write!(f, "compute_handle must not be empty"),
            Self::MissingStage => write!(f, "non-terminal success signal must carry a stage"),
            Self::StageOutOfRange { stage, stage_count } => {
                write!(f, "stage {stage} is outside 1..={stage_count}")
            }
        }
    }
}

impl std::error::Error for SignalError {}

impl ComputeCompletionSignal {
    pub fn classify(&self, stage_count: u8) -> Result<SignalKind, SignalError> {
        if self.compute_handle.trim().is_empty() {
            return Err(SignalError::EmptyHandle);
        }
        if let Some(stage) = self.stage
            && (stage == 0 || stage > stage_count)
        {
            return Err(SignalError::StageOutOfRange { stage, stage_count });
        }
        if !self.success {
            return Ok(SignalKind::Failed);
        }
        if self.terminal {
            return Ok(SignalKind::Succeeded);
        }
        let stage = self
            .stage
            .and_then(StageId::new)
            .ok_or(SignalError::MissingStage)?;
        Ok(SignalKind::StageCompleted(stage))
    }
}

/// One line of the message inbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboxMessage {
    ArtifactCreated(ArtifactNotification),
    ComputeCompleted(ComputeCompletionSignal),
    WatchdogTick,
}
