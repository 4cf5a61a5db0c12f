#![forbid(unsafe_code)]
#![allow(dead_code)]

use bf_core::events::{ArtifactNotification, ComputeCompletionSignal, ComputeSubmission};
use bf_core::{ComputeHandle, JobId, StorageKey};
use bf_orchestrator::{
    BackendError, ComputeBackend, ManualClock, MemoryObjectStore, NoopSleeper, ObjectStore,
    OrchestratorConfig, Runtime,
};
use bf_storage::{JobRecord, SqliteStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const T0_MS: i64 = 1_700_000_000_000;

/// Backend that counts calls and replays a scripted sequence of replies.
/// Once the script is empty every submission gets `H-<job_id>`.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<String, BackendError>>>,
    submissions: Mutex<Vec<ComputeSubmission>>,
}

impl ScriptedBackend {
    pub(crate) fn push(&self, reply: Result<&str, BackendError>) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(reply.map(str::to_string));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn submissions(&self) -> Vec<ComputeSubmission> {
        self.submissions.lock().expect("submissions lock").clone()
    }
}

impl ComputeBackend for ScriptedBackend {
    fn submit(&self, submission: &ComputeSubmission) -> Result<ComputeHandle, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.submissions
            .lock()
            .expect("submissions lock")
            .push(submission.clone());
        let next = self.script.lock().expect("script lock").pop_front();
        let handle = match next {
            Some(reply) => reply?,
            None => format!("H-{}", submission.job_id),
        };
        Ok(ComputeHandle::try_new(handle).expect("scripted handle"))
    }
}

pub(crate) struct Harness {
    pub(crate) dir: tempfile::TempDir,
    pub(crate) runtime: Runtime,
    pub(crate) backend: Arc<ScriptedBackend>,
    pub(crate) objects: Arc<MemoryObjectStore>,
    pub(crate) clock: Arc<ManualClock>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub(crate) fn with_config(tweak: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = OrchestratorConfig {
            storage_dir: dir.path().join("ledger"),
            container_reference: "registry.local/binder:test".to_string(),
            ..OrchestratorConfig::default()
        };
        tweak(&mut config);
        config.validate().expect("valid test config");

        let backend = Arc::new(ScriptedBackend::default());
        let objects = Arc::new(MemoryObjectStore::new());
        let clock = Arc::new(ManualClock::new(T0_MS));
        let runtime = Runtime::new(config, backend.clone(), objects.clone())
            .with_clock(clock.clone())
            .with_sleeper(Arc::new(NoopSleeper));
        Self {
            dir,
            runtime,
            backend,
            objects,
            clock,
        }
    }

    pub(crate) fn store(&self) -> SqliteStore {
        self.runtime.open_ledger().expect("open ledger")
    }

    pub(crate) fn job(&self, job_id: &JobId) -> JobRecord {
        self.store()
            .get(job_id)
            .expect("get job")
            .expect("job exists")
    }

    pub(crate) fn event_count(&self, job_id: &JobId) -> usize {
        self.store().job_events(job_id, 200).expect("events").len()
    }

    pub(crate) fn output_prefix(&self, job_id: &JobId) -> String {
        self.runtime.config.output_prefix(job_id)
    }

    /// Writes scored candidate structures under `<output_prefix>stage3/`.
    pub(crate) fn write_candidates(&self, job_id: &JobId, scores: &[&str]) -> String {
        let dir = format!("{}stage3", self.output_prefix(job_id));
        for (idx, score) in scores.iter().enumerate() {
            self.objects
                .put(&format!("{dir}/design_{}.pdb", idx + 1), &pdb(score))
                .expect("put candidate");
        }
        dir
    }
}

pub(crate) fn job_id_for(key: &str) -> JobId {
    JobId::derive(&StorageKey::try_new(key).expect("storage key"))
}

pub(crate) fn notification(key: &str) -> ArtifactNotification {
    ArtifactNotification {
        storage_key: key.to_string(),
        event_time: Some("2024-05-01T12:00:00Z".to_string()),
    }
}

pub(crate) fn pdb(score: &str) -> Vec<u8> {
    format!(
        "HEADER    DE NOVO BINDER\nREMARK 250 CONFIDENCE {score}\nATOM      1  N   MET A   1      11.104   6.134  -6.504  1.00  0.00           N\nEND\n"
    )
    .into_bytes()
}

pub(crate) fn stage_signal(handle: &str, stage: u8) -> ComputeCompletionSignal {
    ComputeCompletionSignal {
        compute_handle: handle.to_string(),
        job_id: None,
        terminal: false,
        stage: Some(stage),
        success: true,
        output_references: Vec::new(),
        error_classification: None,
        exit_code: None,
        message: None,
    }
}

pub(crate) fn success_signal(handle: &str, outputs: Vec<String>) -> ComputeCompletionSignal {
    ComputeCompletionSignal {
        terminal: true,
        stage: None,
        output_references: outputs,
        ..stage_signal(handle, 1)
    }
}

pub(crate) fn failure_signal(handle: &str, classification: &str) -> ComputeCompletionSignal {
    ComputeCompletionSignal {
        terminal: true,
        success: false,
        error_classification: Some(classification.to_string()),
        exit_code: Some(1),
        ..stage_signal(handle, 2)
    }
}
