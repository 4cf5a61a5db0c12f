#![forbid(unsafe_code)]

pub(super) const LEDGER_SQL: &str = r#"
        CREATE TABLE IF NOT EXISTS ledger_state (
          singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
          schema_version INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
          job_id TEXT PRIMARY KEY,
          revision INTEGER NOT NULL,
          input_reference TEXT NOT NULL,
          input_name TEXT NOT NULL,
          status TEXT NOT NULL,
          compute_handle TEXT,
          failure_reason TEXT,
          failure_detail TEXT,
          result_summary_json TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          completed_at_ms INTEGER,
          CHECK(failure_reason IS NULL OR status = 'FAILED'),
          CHECK(result_summary_json IS NULL OR status = 'COMPLETED')
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_compute_handle
          ON jobs(compute_handle) WHERE compute_handle IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_jobs_status_updated
          ON jobs(status, updated_at_ms);

        CREATE INDEX IF NOT EXISTS idx_jobs_created
          ON jobs(created_at_ms, job_id);

        CREATE TABLE IF NOT EXISTS job_events (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL,
          ts_ms INTEGER NOT NULL,
          kind TEXT NOT NULL,
          from_status TEXT,
          to_status TEXT NOT NULL,
          message TEXT NOT NULL,
          meta_json TEXT,
          FOREIGN KEY(job_id) REFERENCES jobs(job_id)
        );

        CREATE INDEX IF NOT EXISTS idx_job_events_job_seq
          ON job_events(job_id, seq);
"#;
