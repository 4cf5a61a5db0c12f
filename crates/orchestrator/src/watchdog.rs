#![forbid(unsafe_code)]

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::retry::{Sleeper, retry_ledger};
use bf_core::{FailureClass, JobStatus};
use bf_storage::{JobTransitionRequest, SqliteStore, TransitionFields, TransitionOutcome};
use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub timed_out: Vec<String>,
    /// Records that moved between the scan and the write.
    pub skipped: usize,
}

/// Reclaims jobs that stopped making progress.
pub struct Watchdog<'a> {
    config: &'a OrchestratorConfig,
    sleeper: &'a dyn Sleeper,
}

impl<'a> Watchdog<'a> {
    pub fn new(config: &'a OrchestratorConfig, sleeper: &'a dyn Sleeper) -> Self {
        Self { config, sleeper }
    }

    /// Fails every non-terminal record whose last write is older than the
    /// configured maximum job duration, as seen from `now_ms`.
    pub fn sweep(
        &self,
        store: &mut SqliteStore,
        now_ms: i64,
    ) -> Result<SweepReport, OrchestratorError> {
        let max_ms = self.config.max_job_duration_ms();
        let cutoff = now_ms.saturating_sub(max_ms);
        let mut report = SweepReport::default();

        loop {
            let stale = retry_ledger(&self.config.ledger_retry, self.sleeper, "ledger_stale_scan", || {
                store.stale_jobs(cutoff, self.config.watchdog_batch)
            })?;
            if stale.is_empty() {
                break;
            }
            report.scanned += stale.len();

            let mut applied = 0usize;
            for job in stale {
                let idle_s = now_ms.saturating_sub(job.updated_at_ms) / 1_000;
                let request = JobTransitionRequest {
                    job_id: job.job_id.clone(),
                    expected: vec![job.status],
                    new_status: JobStatus::Failed,
                    fields: TransitionFields {
                        failure_reason: Some(FailureClass::Timeout.as_str().to_string()),
                        failure_detail: Some(format!(
                            "no progress for {idle_s}s while {}",
                            job.status
                        )),
                        ..TransitionFields::default()
                    },
                    now_ms,
                    message: "watchdog timeout".to_string(),
                };
                let outcome = retry_ledger(
                    &self.config.ledger_retry,
                    self.sleeper,
                    "ledger_timeout",
                    || store.compare_and_set_status(request.clone()),
                )?;
                match outcome {
                    TransitionOutcome::Applied { job, .. } => {
                        tracing::warn!(
                            job_id = %job.job_id,
                            idle_s,
                            "job timed out"
                        );
                        applied += 1;
                        report.timed_out.push(job.job_id.into_string());
                    }
                    TransitionOutcome::Rejected { current } => {
                        tracing::debug!(
                            job_id = %current.job_id,
                            status = %current.status,
                            "job moved before timeout was applied"
                        );
                        report.skipped += 1;
                    }
                }
            }
            if applied == 0 {
                break;
            }
        }

        if !report.timed_out.is_empty() {
            tracing::info!(
                timed_out = report.timed_out.len(),
                scanned = report.scanned,
                "watchdog sweep finished"
            );
        }
        Ok(report)
    }
}
