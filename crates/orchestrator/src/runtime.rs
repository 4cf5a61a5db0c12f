#![forbid(unsafe_code)]

use crate::backend::{CommandBackend, ComputeBackend, DryRunBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, ConfigError, OrchestratorConfig};
use crate::dispatcher::Dispatcher;
use crate::error::OrchestratorError;
use crate::object_store::{LocalObjectStore, ObjectStore};
use crate::reconciler::Reconciler;
use crate::retry::{Sleeper, ThreadSleeper};
use crate::watchdog::Watchdog;
use bf_core::events::InboxMessage;
use bf_storage::SqliteStore;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Collaborators shared by every handler invocation. Holds no job state;
/// each invocation reads what it needs from the ledger.
#[derive(Clone)]
pub struct Runtime {
    pub config: OrchestratorConfig,
    pub backend: Arc<dyn ComputeBackend>,
    pub objects: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl Runtime {
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn ComputeBackend>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            backend,
            objects,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    /// Validates `config` and builds the configured backend and object store.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let backend: Arc<dyn ComputeBackend> = match config.backend.kind {
            BackendKind::DryRun => Arc::new(DryRunBackend),
            BackendKind::Command => {
                let program = config.backend.program.clone().ok_or_else(|| {
                    ConfigError::Invalid("backend.program is required".to_string())
                })?;
                Arc::new(CommandBackend::new(
                    program,
                    config.backend.args.clone(),
                    Duration::from_secs(config.backend.timeout_s.max(1)),
                ))
            }
        };
        let objects: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(config.object_store_root.clone()));
        Ok(Self::new(config, backend, objects))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn open_ledger(&self) -> Result<SqliteStore, OrchestratorError> {
        Ok(SqliteStore::open(&self.config.storage_dir)?)
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(
            &self.config,
            self.backend.as_ref(),
            self.clock.as_ref(),
            self.sleeper.as_ref(),
        )
    }

    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(
            &self.config,
            self.objects.as_ref(),
            self.clock.as_ref(),
            self.sleeper.as_ref(),
        )
    }

    pub fn watchdog(&self) -> Watchdog<'_> {
        Watchdog::new(&self.config, self.sleeper.as_ref())
    }

    /// Routes one message to its handler and summarizes the outcome.
    pub fn handle_message(
        &self,
        store: &mut SqliteStore,
        message: &InboxMessage,
    ) -> Result<Value, OrchestratorError> {
        match message {
            InboxMessage::ArtifactCreated(event) => {
                let outcome = self.dispatcher().handle_notification(store, event)?;
                let mut out = json!({
                    "type": "artifact_created",
                    "outcome": outcome.label(),
                });
                if let crate::dispatcher::DispatchOutcome::Ignored(reason) = &outcome {
                    out["reason"] = json!(reason);
                }
                if let Some(job) = outcome.job() {
                    out["job_id"] = json!(job.job_id.as_str());
                    out["status"] = json!(job.status);
                }
                Ok(out)
            }
            InboxMessage::ComputeCompleted(signal) => {
                let outcome = self.reconciler().handle_signal(store, signal)?;
                let mut out = json!({
                    "type": "compute_completed",
                    "outcome": outcome.label(),
                });
                if let crate::reconciler::ReconcileOutcome::Invalid(reason) = &outcome {
                    out["reason"] = json!(reason);
                }
                if let Some(job) = outcome.job() {
                    out["job_id"] = json!(job.job_id.as_str());
                    out["status"] = json!(job.status);
                    if let Some(reason) = job.failure_reason.as_deref() {
                        out["failure_reason"] = json!(reason);
                    }
                }
                Ok(out)
            }
            InboxMessage::WatchdogTick => {
                let report = self.watchdog().sweep(store, self.clock.now_ms())?;
                Ok(json!({
                    "type": "watchdog_tick",
                    "outcome": "swept",
                    "report": report,
                }))
            }
        }
    }
}
