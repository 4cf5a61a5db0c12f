#![forbid(unsafe_code)]

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::manifest::{ManifestBuilder, ManifestJob};
use crate::object_store::ObjectStore;
use crate::retry::{Sleeper, retry_ledger};
use bf_core::events::{ComputeCompletionSignal, SignalKind};
use bf_core::manifest::JobResultSummary;
use bf_core::{ComputeHandle, FailureClass, JobId, JobStatus};
use bf_storage::{
    JobRecord, JobTransitionRequest, SqliteStore, TransitionFields, TransitionOutcome,
};

#[derive(Clone, Debug)]
pub enum ReconcileOutcome {
    /// Moved to a `STAGE_n_DONE` state.
    Advanced(JobRecord),
    Completed(JobRecord),
    Failed(JobRecord),
    /// Duplicate, stale or out-of-order signal; the record is unchanged.
    Redundant(JobRecord),
    /// No record matches the signal. Nothing was written.
    Unknown,
    /// Malformed or inconsistent signal. Nothing was written.
    Invalid(String),
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Advanced(_) => "advanced",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Redundant(_) => "redundant",
            Self::Unknown => "unknown",
            Self::Invalid(_) => "invalid",
        }
    }

    pub fn job(&self) -> Option<&JobRecord> {
        match self {
            Self::Advanced(job) | Self::Completed(job) | Self::Failed(job) | Self::Redundant(job) => {
                Some(job)
            }
            Self::Unknown | Self::Invalid(_) => None,
        }
    }
}

/// Applies compute completion signals to the ledger. Stateless between calls.
pub struct Reconciler<'a> {
    config: &'a OrchestratorConfig,
    objects: &'a dyn ObjectStore,
    clock: &'a dyn Clock,
    sleeper: &'a dyn Sleeper,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        config: &'a OrchestratorConfig,
        objects: &'a dyn ObjectStore,
        clock: &'a dyn Clock,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            config,
            objects,
            clock,
            sleeper,
        }
    }

    pub fn handle_signal(
        &self,
        store: &mut SqliteStore,
        signal: &ComputeCompletionSignal,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let kind = match signal.classify(self.config.stage_count) {
            Ok(kind) => kind,
            Err(err) => return Ok(invalid(signal, err.to_string())),
        };
        let handle = match ComputeHandle::try_new(signal.compute_handle.as_str()) {
            Ok(handle) => handle,
            Err(err) => return Ok(invalid(signal, format!("compute_handle: {err}"))),
        };

        let record = match self.lookup(store, signal, &handle)? {
            Lookup::Found(record) => record,
            Lookup::Missing => {
                tracing::warn!(
                    compute_handle = %handle,
                    job_id = signal.job_id.as_deref().unwrap_or(""),
                    "signal for unknown job dropped"
                );
                return Ok(ReconcileOutcome::Unknown);
            }
            Lookup::Invalid(reason) => return Ok(invalid(signal, reason)),
        };

        if record.status.is_terminal() {
            tracing::info!(
                job_id = %record.job_id,
                status = %record.status,
                "signal for terminal job ignored"
            );
            return Ok(ReconcileOutcome::Redundant(record));
        }

        match kind {
            SignalKind::StageCompleted(stage) => {
                let expected = self.config.out_of_order_policy.accepted_from(stage);
                let outcome = self.transition(
                    store,
                    &record,
                    expected,
                    JobStatus::StageDone(stage),
                    TransitionFields {
                        compute_handle: Some(handle),
                        ..TransitionFields::default()
                    },
                    format!("{} completed", stage.label()),
                )?;
                Ok(match outcome {
                    TransitionOutcome::Applied { job, .. } => {
                        tracing::info!(job_id = %job.job_id, status = %job.status, "stage advanced");
                        ReconcileOutcome::Advanced(job)
                    }
                    TransitionOutcome::Rejected { current } => {
                        tracing::info!(
                            job_id = %current.job_id,
                            status = %current.status,
                            stage = stage.index(),
                            "stage signal redundant"
                        );
                        ReconcileOutcome::Redundant(current)
                    }
                })
            }
            SignalKind::Succeeded => self.complete(store, &record, handle, signal),
            SignalKind::Failed => {
                let class = FailureClass::classify(signal.error_classification.as_deref());
                let detail = failure_detail(signal);
                self.fail(store, &record, handle, class, detail)
            }
        }
    }

    fn lookup(
        &self,
        store: &SqliteStore,
        signal: &ComputeCompletionSignal,
        handle: &ComputeHandle,
    ) -> Result<Lookup, OrchestratorError> {
        let echoed = signal
            .job_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let Some(raw) = echoed else {
            return Ok(match store.find_by_compute_handle(handle)? {
                Some(record) => Lookup::Found(record),
                None => Lookup::Missing,
            });
        };

        let job_id = match JobId::try_new(raw) {
            Ok(job_id) => job_id,
            Err(err) => return Ok(Lookup::Invalid(format!("job_id: {err}"))),
        };
        let Some(record) = store.get(&job_id)? else {
            return Ok(Lookup::Missing);
        };
        if let Some(existing) = record.compute_handle.as_ref()
            && existing != handle
        {
            return Ok(Lookup::Invalid(format!(
                "compute_handle {handle} does not match {existing} on {job_id}"
            )));
        }
        Ok(Lookup::Found(record))
    }

    fn complete(
        &self,
        store: &mut SqliteStore,
        record: &JobRecord,
        handle: ComputeHandle,
        signal: &ComputeCompletionSignal,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let output_prefix = self.config.output_prefix(&record.job_id);
        let builder = ManifestBuilder::new(
            self.objects,
            &self.config.pipeline_version,
            self.config.stage_count,
            self.config.final_designs_limit,
        );
        let built = builder.build(
            ManifestJob {
                job_id: &record.job_id,
                input_name: &record.input_name,
                output_prefix: &output_prefix,
            },
            &signal.output_references,
            self.clock.now_ms(),
        );
        let built = match built {
            Ok(built) => built,
            Err(err) => {
                tracing::warn!(job_id = %record.job_id, error = %err, "manifest build failed");
                return self.fail(
                    store,
                    record,
                    handle,
                    FailureClass::ManifestError,
                    err.to_string(),
                );
            }
        };

        let summary = JobResultSummary::from_manifest(&built.manifest, built.manifest_key);
        let outcome = self.transition(
            store,
            record,
            JobStatus::non_terminal(self.config.stage_count),
            JobStatus::Completed,
            TransitionFields {
                compute_handle: Some(handle),
                result_summary_json: Some(serde_json::to_string(&summary)?),
                ..TransitionFields::default()
            },
            "pipeline completed".to_string(),
        )?;
        Ok(match outcome {
            TransitionOutcome::Applied { job, .. } => {
                tracing::info!(
                    job_id = %job.job_id,
                    designs = summary.results_summary.total_designs_generated,
                    "job completed"
                );
                ReconcileOutcome::Completed(job)
            }
            TransitionOutcome::Rejected { current } => ReconcileOutcome::Redundant(current),
        })
    }

    fn fail(
        &self,
        store: &mut SqliteStore,
        record: &JobRecord,
        handle: ComputeHandle,
        class: FailureClass,
        detail: String,
    ) -> Result<ReconcileOutcome, OrchestratorError> {
        let outcome = self.transition(
            store,
            record,
            JobStatus::non_terminal(self.config.stage_count),
            JobStatus::Failed,
            TransitionFields {
                compute_handle: Some(handle),
                failure_reason: Some(class.as_str().to_string()),
                failure_detail: Some(detail),
                ..TransitionFields::default()
            },
            format!("failed: {class}"),
        )?;
        Ok(match outcome {
            TransitionOutcome::Applied { job, .. } => {
                tracing::warn!(job_id = %job.job_id, failure_reason = %class, "job failed");
                ReconcileOutcome::Failed(job)
            }
            TransitionOutcome::Rejected { current } => ReconcileOutcome::Redundant(current),
        })
    }

    fn transition(
        &self,
        store: &mut SqliteStore,
        record: &JobRecord,
        expected: Vec<JobStatus>,
        new_status: JobStatus,
        fields: TransitionFields,
        message: String,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        let request = JobTransitionRequest {
            job_id: record.job_id.clone(),
            expected,
            new_status,
            fields,
            now_ms: self.clock.now_ms(),
            message,
        };
        Ok(retry_ledger(
            &self.config.ledger_retry,
            self.sleeper,
            "ledger_reconcile",
            || store.compare_and_set_status(request.clone()),
        )?)
    }
}

enum Lookup {
    Found(JobRecord),
    Missing,
    Invalid(String),
}

fn invalid(signal: &ComputeCompletionSignal, reason: String) -> ReconcileOutcome {
    tracing::warn!(
        compute_handle = %signal.compute_handle,
        %reason,
        "invalid completion signal dropped"
    );
    ReconcileOutcome::Invalid(reason)
}

fn failure_detail(signal: &ComputeCompletionSignal) -> String {
    let mut parts = Vec::new();
    if let Some(stage) = signal.stage {
        parts.push(format!("stage {stage}"));
    }
    if let Some(code) = signal.exit_code {
        parts.push(format!("exit code {code}"));
    }
    if let Some(class) = signal
        .error_classification
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        parts.push(class.trim().to_string());
    }
    if let Some(message) = signal.message.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(message.trim().to_string());
    }
    if parts.is_empty() {
        "compute backend reported failure".to_string()
    } else {
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> ComputeCompletionSignal {
        ComputeCompletionSignal {
            compute_handle: "H1".to_string(),
            job_id: None,
            terminal: true,
            stage: Some(2),
            success: false,
            output_references: Vec::new(),
            error_classification: Some("OutOfMemory".to_string()),
            exit_code: Some(137),
            message: Some(" killed ".to_string()),
        }
    }

    #[test]
    fn failure_detail_collects_signal_metadata() {
        assert_eq!(
            failure_detail(&signal()),
            "stage 2; exit code 137; OutOfMemory; killed"
        );
        let bare = ComputeCompletionSignal {
            stage: None,
            exit_code: None,
            error_classification: None,
            message: None,
            ..signal()
        };
        assert_eq!(failure_detail(&bare), "compute backend reported failure");
    }
}
