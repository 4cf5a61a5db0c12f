#![forbid(unsafe_code)]

mod support;
use support::*;

use bf_core::events::ComputeCompletionSignal;
use bf_core::manifest::{JobResultSummary, ResultManifest};
use bf_core::{ComputeHandle, JobStatus, StageId};
use bf_orchestrator::{
    BackendError, ComputeBackend, DispatchOutcome, ManualClock, MemoryObjectStore, NoopSleeper,
    ObjectStore, OrchestratorConfig, ReconcileOutcome, Reconciler, Runtime,
};
use bf_storage::{JobCreateRequest, JobsListRequest, SqliteStore};
use std::sync::{Arc, Barrier};

fn stage(n: u8) -> JobStatus {
    JobStatus::StageDone(StageId::new(n).expect("stage"))
}

#[test]
fn artifact_runs_through_every_stage_to_completion() {
    let h = Harness::new();
    h.backend.push(Ok("H1"));
    let mut store = h.store();
    let job_id = job_id_for("targets/abc.pdb");

    let outcome = h
        .runtime
        .dispatcher()
        .handle_notification(&mut store, &notification("targets/abc.pdb"))
        .expect("dispatch");
    let DispatchOutcome::Submitted(job) = outcome else {
        panic!("expected submission, got {outcome:?}");
    };
    assert_eq!(job.job_id, job_id);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.compute_handle.as_ref().map(ComputeHandle::as_str), Some("H1"));
    assert_eq!(job.input_name, "abc");
    assert_eq!(job.input_reference, "targets/abc.pdb");

    let submissions = h.backend.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].job_id, job_id.as_str());
    assert_eq!(submissions[0].client_token, job_id.as_str());
    assert_eq!(submissions[0].container_reference, "registry.local/binder:test");
    assert_eq!(submissions[0].parameters.input_reference, "targets/abc.pdb");
    assert_eq!(
        submissions[0].parameters.output_prefix,
        format!("results/{job_id}/")
    );

    let reconciler = h.runtime.reconciler();
    for n in 1..=3u8 {
        h.clock.advance(60_000);
        let outcome = reconciler
            .handle_signal(&mut store, &stage_signal("H1", n))
            .expect("stage signal");
        let ReconcileOutcome::Advanced(job) = outcome else {
            panic!("stage {n}: expected advance, got {outcome:?}");
        };
        assert_eq!(job.status, stage(n));
    }

    let outputs = h.write_candidates(&job_id, &["0.87", "0.65", "0.91"]);
    h.clock.advance(60_000);
    let outcome = reconciler
        .handle_signal(&mut store, &success_signal("H1", vec![outputs]))
        .expect("success signal");
    let ReconcileOutcome::Completed(job) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.failure_reason.is_none());
    assert_eq!(job.completed_at_ms, Some(T0_MS + 4 * 60_000));

    let summary: JobResultSummary =
        serde_json::from_str(job.result_summary_json.as_deref().expect("summary")).expect("json");
    assert_eq!(summary.results_summary.total_designs_generated, 3);
    assert_eq!(summary.results_summary.best_confidence_score, 0.91);
    assert!((summary.results_summary.average_confidence_score - 0.81).abs() < 1e-9);
    let ordered: Vec<f64> = summary
        .final_designs
        .iter()
        .map(|d| d.confidence_score)
        .collect();
    assert_eq!(ordered, vec![0.91, 0.87, 0.65]);

    let manifest_key = format!("results/{job_id}/confidence_metrics.json");
    assert_eq!(summary.manifest_key, manifest_key);
    let manifest: ResultManifest =
        serde_json::from_slice(&h.objects.get(&manifest_key).expect("manifest")).expect("json");
    assert_eq!(manifest.job_id, job_id.as_str());
    assert_eq!(manifest.input_name, "abc");
    assert_eq!(manifest.final_designs, summary.final_designs);

    let events = store.job_events(&job_id, 50).expect("events");
    let trail: Vec<&str> = events.iter().map(|e| e.to_status.as_str()).collect();
    assert_eq!(
        trail,
        vec![
            "SUBMITTED",
            "RUNNING",
            "STAGE_1_DONE",
            "STAGE_2_DONE",
            "STAGE_3_DONE",
            "COMPLETED"
        ]
    );
}

#[test]
fn redelivered_notification_submits_once() {
    let h = Harness::new();
    let mut store = h.store();
    let dispatcher = h.runtime.dispatcher();

    let first = dispatcher
        .handle_notification(&mut store, &notification("targets/abc.pdb"))
        .expect("first");
    assert!(matches!(first, DispatchOutcome::Submitted(_)));

    for _ in 0..4 {
        let again = dispatcher
            .handle_notification(&mut store, &notification("targets/abc.pdb"))
            .expect("redelivery");
        let DispatchOutcome::Duplicate(job) = again else {
            panic!("expected duplicate, got {again:?}");
        };
        assert_eq!(job.status, JobStatus::Running);
    }

    assert_eq!(h.backend.calls(), 1);
    let all = store
        .list(JobsListRequest {
            status: None,
            limit: 50,
            offset: 0,
        })
        .expect("list");
    assert_eq!(all.jobs.len(), 1);
}

#[test]
fn concurrent_redelivery_creates_one_record_and_one_submission() {
    let h = Harness::new();
    // Open the ledger once so the schema exists before the race.
    drop(h.store());
    let threads = 8;
    let barrier = Barrier::new(threads);

    let outcomes: Vec<DispatchOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    let mut store = h.runtime.open_ledger().expect("open");
                    barrier.wait();
                    h.runtime
                        .dispatcher()
                        .handle_notification(&mut store, &notification("targets/abc.pdb"))
                        .expect("dispatch")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect()
    });

    let submitted = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Submitted(_)))
        .count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Duplicate(_)))
        .count();
    assert_eq!(submitted, 1);
    assert_eq!(duplicates, threads - 1);
    assert_eq!(h.backend.calls(), 1);
    assert_eq!(h.event_count(&job_id_for("targets/abc.pdb")), 2);
}

#[test]
fn unrelated_keys_are_ignored_without_writes() {
    let h = Harness::new();
    let mut store = h.store();
    for key in [
        "results/abc.pdb",
        "targets/abc.txt",
        "targets/sub/abc.pdb",
        "targets/ .pdb",
        "targets/",
        "",
    ] {
        let outcome = h
            .runtime
            .dispatcher()
            .handle_notification(&mut store, &notification(key))
            .expect("dispatch");
        assert!(
            matches!(outcome, DispatchOutcome::Ignored(_)),
            "{key:?} -> {outcome:?}"
        );
    }
    assert_eq!(h.backend.calls(), 0);
    assert!(store.status_counts().expect("counts").is_empty());
}

#[test]
fn signal_for_unknown_job_is_dropped() {
    let h = Harness::new();
    let mut store = h.store();
    let reconciler = h.runtime.reconciler();

    let outcome = reconciler
        .handle_signal(&mut store, &stage_signal("NOPE", 1))
        .expect("reconcile");
    assert!(matches!(outcome, ReconcileOutcome::Unknown));

    let echoed = ComputeCompletionSignal {
        job_id: Some(job_id_for("targets/ghost.pdb").into_string()),
        ..success_signal("NOPE", Vec::new())
    };
    let outcome = reconciler
        .handle_signal(&mut store, &echoed)
        .expect("reconcile");
    assert!(matches!(outcome, ReconcileOutcome::Unknown));
    assert!(store.status_counts().expect("counts").is_empty());

    // A live job is untouched by a signal carrying someone else's handle.
    h.runtime
        .dispatcher()
        .handle_notification(&mut store, &notification("targets/abc.pdb"))
        .expect("dispatch");
    let job_id = job_id_for("targets/abc.pdb");
    let before = h.event_count(&job_id);
    let outcome = reconciler
        .handle_signal(&mut store, &failure_signal("OTHER", "stage crashed"))
        .expect("reconcile");
    assert!(matches!(outcome, ReconcileOutcome::Unknown));
    assert_eq!(h.event_count(&job_id), before);
    assert_eq!(h.job(&job_id).status, JobStatus::Running);
}

#[test]
fn malformed_and_inconsistent_signals_are_invalid() {
    let h = Harness::new();
    let mut store = h.store();
    h.backend.push(Ok("H1"));
    h.runtime
        .dispatcher()
        .handle_notification(&mut store, &notification("targets/abc.pdb"))
        .expect("dispatch");
    let job_id = job_id_for("targets/abc.pdb");
    let before = h.event_count(&job_id);
    let reconciler = h.runtime.reconciler();

    let no_stage = ComputeCompletionSignal {
        stage: None,
        ..stage_signal("H1", 1)
    };
    let bad_signals = vec![
        stage_signal("H1", 0),
        stage_signal("H1", 4),
        stage_signal("   ", 1),
        no_stage,
        ComputeCompletionSignal {
            job_id: Some("not-a-job".to_string()),
            ..stage_signal("H1", 1)
        },
        ComputeCompletionSignal {
            job_id: Some(job_id.as_str().to_string()),
            ..stage_signal("H2", 1)
        },
    ];
    for signal in &bad_signals {
        let outcome = reconciler.handle_signal(&mut store, signal).expect("reconcile");
        assert!(
            matches!(outcome, ReconcileOutcome::Invalid(_)),
            "{signal:?} -> {outcome:?}"
        );
    }
    assert_eq!(h.event_count(&job_id), before);
    assert_eq!(h.job(&job_id).status, JobStatus::Running);
}

#[test]
fn completion_racing_ahead_of_dispatcher_is_accepted() {
    let h = Harness::new();
    let mut store = h.store();
    let job_id = job_id_for("targets/fast.pdb");
    store
        .create_if_absent(JobCreateRequest {
            job_id: job_id.clone(),
            input_reference: "targets/fast.pdb".to_string(),
            input_name: "fast".to_string(),
            now_ms: T0_MS,
        })
        .expect("create");

    let outputs = h.write_candidates(&job_id, &["0.5", "0.7"]);
    let signal = ComputeCompletionSignal {
        job_id: Some(job_id.as_str().to_string()),
        ..success_signal("H9", vec![outputs])
    };
    let outcome = h
        .runtime
        .reconciler()
        .handle_signal(&mut store, &signal)
        .expect("reconcile");
    let ReconcileOutcome::Completed(job) = outcome else {
        panic!("expected completion from SUBMITTED, got {outcome:?}");
    };
    assert_eq!(job.compute_handle.as_ref().map(ComputeHandle::as_str), Some("H9"));

    let late_stage = h
        .runtime
        .reconciler()
        .handle_signal(&mut store, &stage_signal("H9", 1))
        .expect("reconcile");
    assert!(matches!(late_stage, ReconcileOutcome::Redundant(_)));
}

/// Reports a failure for the job from inside `submit`, before the dispatcher
/// records RUNNING.
struct RacingBackend {
    config: OrchestratorConfig,
}

impl ComputeBackend for RacingBackend {
    fn submit(
        &self,
        submission: &bf_core::events::ComputeSubmission,
    ) -> Result<ComputeHandle, BackendError> {
        let mut store = SqliteStore::open(&self.config.storage_dir).expect("open");
        let objects = MemoryObjectStore::new();
        let clock = ManualClock::new(T0_MS);
        let signal = ComputeCompletionSignal {
            job_id: Some(submission.job_id.clone()),
            ..failure_signal("H-race", "OutOfMemory")
        };
        let outcome = Reconciler::new(&self.config, &objects, &clock, &NoopSleeper)
            .handle_signal(&mut store, &signal)
            .expect("reconcile inside submit");
        assert!(matches!(outcome, ReconcileOutcome::Failed(_)));
        Ok(ComputeHandle::try_new("H-race").expect("handle"))
    }
}

#[test]
fn dispatcher_keeps_handle_when_signal_wins_the_race() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = OrchestratorConfig {
        storage_dir: dir.path().join("ledger"),
        ..OrchestratorConfig::default()
    };
    let runtime = Runtime::new(
        config.clone(),
        Arc::new(RacingBackend { config }),
        Arc::new(MemoryObjectStore::new()),
    )
    .with_sleeper(Arc::new(NoopSleeper));
    let mut store = runtime.open_ledger().expect("open");

    let outcome = runtime
        .dispatcher()
        .handle_notification(&mut store, &notification("targets/race.pdb"))
        .expect("dispatch");
    let DispatchOutcome::Raced(job) = outcome else {
        panic!("expected raced outcome, got {outcome:?}");
    };
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("resource_capacity"));
    assert_eq!(job.compute_handle.as_ref().map(ComputeHandle::as_str), Some("H-race"));
}
