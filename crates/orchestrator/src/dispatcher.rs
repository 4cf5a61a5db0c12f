#![forbid(unsafe_code)]

use crate::backend::{BackendError, ComputeBackend};
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::retry::{Sleeper, retry, retry_ledger};
use bf_core::events::{ArtifactNotification, ComputeSubmission, SubmissionParameters};
use bf_core::{FailureClass, JobId, JobStatus, StorageKey};
use bf_storage::{
    JobCreateRequest, JobRecord, JobTransitionRequest, SqliteStore, TransitionFields,
    TransitionOutcome,
};

#[derive(Clone, Debug)]
pub enum DispatchOutcome {
    /// The key does not follow the input convention; nothing was written.
    Ignored(String),
    /// A record already existed; no second submission was made.
    Duplicate(JobRecord),
    Submitted(JobRecord),
    SubmissionFailed(JobRecord),
    /// Another writer moved the record off SUBMITTED before the dispatcher's
    /// follow-up write.
    Raced(JobRecord),
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored(_) => "ignored",
            Self::Duplicate(_) => "duplicate",
            Self::Submitted(_) => "submitted",
            Self::SubmissionFailed(_) => "submission_failed",
            Self::Raced(_) => "raced",
        }
    }

    pub fn job(&self) -> Option<&JobRecord> {
        match self {
            Self::Ignored(_) => None,
            Self::Duplicate(job)
            | Self::Submitted(job)
            | Self::SubmissionFailed(job)
            | Self::Raced(job) => Some(job),
        }
    }
}

/// Accepted input artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputArtifact {
    pub key: StorageKey,
    pub input_name: String,
}

/// Applies the `<input_prefix><name>.<input_extension>` convention.
pub fn match_input_key(config: &OrchestratorConfig, raw: &str) -> Result<InputArtifact, String> {
    let key = StorageKey::try_new(raw.trim()).map_err(|err| format!("invalid key: {err}"))?;
    let rest = key
        .as_str()
        .strip_prefix(config.input_prefix.as_str())
        .ok_or_else(|| format!("outside {}", config.input_prefix))?;
    if rest.contains('/') {
        return Err("not a direct child of the input prefix".to_string());
    }
    let wanted = config.input_extension.trim_start_matches('.');
    let Some((stem, extension)) = rest.rsplit_once('.') else {
        return Err("missing file extension".to_string());
    };
    if !extension.eq_ignore_ascii_case(wanted) {
        return Err(format!("extension .{extension} is not .{wanted}"));
    }
    if stem.trim().is_empty() {
        return Err("empty input name".to_string());
    }
    let input_name = key.file_stem().to_string();
    Ok(InputArtifact { key, input_name })
}

/// Handles "new artifact" notifications. Stateless between calls.
pub struct Dispatcher<'a> {
    config: &'a OrchestratorConfig,
    backend: &'a dyn ComputeBackend,
    clock: &'a dyn Clock,
    sleeper: &'a dyn Sleeper,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        config: &'a OrchestratorConfig,
        backend: &'a dyn ComputeBackend,
        clock: &'a dyn Clock,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            config,
            backend,
            clock,
            sleeper,
        }
    }

    /// Creates the job record (once per storage key) and submits it.
    ///
    /// If the ledger write after a successful submission fails, the error is
    /// returned and the record stays SUBMITTED until the watchdog reclaims it;
    /// a redelivered notification does not resubmit.
    pub fn handle_notification(
        &self,
        store: &mut SqliteStore,
        event: &ArtifactNotification,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let artifact = match match_input_key(self.config, &event.storage_key) {
            Ok(artifact) => artifact,
            Err(reason) => {
                tracing::debug!(storage_key = %event.storage_key, %reason, "notification ignored");
                return Ok(DispatchOutcome::Ignored(reason));
            }
        };

        let job_id = JobId::derive(&artifact.key);
        let request = JobCreateRequest {
            job_id: job_id.clone(),
            input_reference: artifact.key.as_str().to_string(),
            input_name: artifact.input_name.clone(),
            now_ms: self.clock.now_ms(),
        };
        let created = retry_ledger(&self.config.ledger_retry, self.sleeper, "ledger_create", || {
            store.create_if_absent(request.clone())
        })?;
        if !created.created {
            tracing::info!(
                job_id = %job_id,
                status = %created.job.status,
                "duplicate notification; record already exists"
            );
            return Ok(DispatchOutcome::Duplicate(created.job));
        }
        tracing::info!(job_id = %job_id, input = %artifact.key, "job created");

        let submission = ComputeSubmission::new(
            &job_id,
            &self.config.container_reference,
            SubmissionParameters {
                input_reference: artifact.key.as_str().to_string(),
                output_prefix: self.config.output_prefix(&job_id),
                input_name: artifact.input_name,
            },
        );
        let submitted = retry(
            &self.config.submit_retry,
            self.sleeper,
            "compute_submit",
            |_| self.backend.submit(&submission),
            BackendError::is_transient,
        );

        match submitted {
            Ok(handle) => {
                let transition = JobTransitionRequest {
                    job_id: job_id.clone(),
                    expected: vec![JobStatus::Submitted],
                    new_status: JobStatus::Running,
                    fields: TransitionFields {
                        compute_handle: Some(handle.clone()),
                        ..TransitionFields::default()
                    },
                    now_ms: self.clock.now_ms(),
                    message: "submitted to compute backend".to_string(),
                };
                let outcome = retry_ledger(
                    &self.config.ledger_retry,
                    self.sleeper,
                    "ledger_running",
                    || store.compare_and_set_status(transition.clone()),
                )
                .inspect_err(|err| {
                    tracing::error!(
                        job_id = %job_id,
                        compute_handle = %handle,
                        error = %err,
                        "submission accepted but ledger write failed"
                    );
                })?;
                match outcome {
                    TransitionOutcome::Applied { job, .. } => {
                        tracing::info!(
                            job_id = %job_id,
                            compute_handle = %handle,
                            status = %job.status,
                            "job submitted"
                        );
                        Ok(DispatchOutcome::Submitted(job))
                    }
                    TransitionOutcome::Rejected { current } => {
                        let now_ms = self.clock.now_ms();
                        let job = retry_ledger(
                            &self.config.ledger_retry,
                            self.sleeper,
                            "ledger_attach_handle",
                            || store.attach_compute_handle(&job_id, &handle, now_ms),
                        )?;
                        tracing::info!(
                            job_id = %job_id,
                            compute_handle = %handle,
                            status = %current.status,
                            "record advanced before submission was recorded; handle attached"
                        );
                        Ok(DispatchOutcome::Raced(job))
                    }
                }
            }
            Err(exhausted) => {
                let detail = format!(
                    "{} (after {} attempt(s))",
                    exhausted.last_error, exhausted.attempts
                );
                tracing::warn!(
                    job_id = %job_id,
                    attempt = exhausted.attempts,
                    error = %exhausted.last_error,
                    "compute submission failed"
                );
                let transition = JobTransitionRequest {
                    job_id: job_id.clone(),
                    expected: vec![JobStatus::Submitted],
                    new_status: JobStatus::Failed,
                    fields: TransitionFields {
                        failure_reason: Some(FailureClass::SubmissionError.as_str().to_string()),
                        failure_detail: Some(detail),
                        ..TransitionFields::default()
                    },
                    now_ms: self.clock.now_ms(),
                    message: "compute submission failed".to_string(),
                };
                let outcome = retry_ledger(
                    &self.config.ledger_retry,
                    self.sleeper,
                    "ledger_submission_failed",
                    || store.compare_and_set_status(transition.clone()),
                )?;
                match outcome {
                    TransitionOutcome::Applied { job, .. } => {
                        Ok(DispatchOutcome::SubmissionFailed(job))
                    }
                    TransitionOutcome::Rejected { current } => Ok(DispatchOutcome::Raced(current)),
                }
            }
        }
    }
}
