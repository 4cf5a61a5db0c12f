#![forbid(unsafe_code)]

use super::*;
use bf_core::{ComputeHandle, JobId, JobStatus};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter};
use serde_json::{Map as JsonMap, Value as JsonValue};

const MAX_LIST_LIMIT: usize = 200;
const MAX_EVENT_MESSAGE_LEN: usize = 400;
const MAX_FAILURE_DETAIL_LEN: usize = 4_000;
const MAX_INPUT_REFERENCE_LEN: usize = 2_048;

const JOB_COLUMNS: &str = "job_id, revision, input_reference, input_name, status, compute_handle, \
     failure_reason, failure_detail, result_summary_json, created_at_ms, updated_at_ms, completed_at_ms";

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(message),
    )
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRecord, rusqlite::Error> {
    let job_id: String = row.get(0)?;
    let job_id = JobId::try_new(job_id).map_err(|err| conversion_error(0, err.to_string()))?;
    let status: String = row.get(4)?;
    let status = JobStatus::parse(&status).map_err(|err| conversion_error(4, err.to_string()))?;
    let compute_handle = row
        .get::<_, Option<String>>(5)?
        .map(ComputeHandle::try_new)
        .transpose()
        .map_err(|err| conversion_error(5, err.to_string()))?;
    Ok(JobRecord {
        job_id,
        revision: row.get(1)?,
        input_reference: row.get(2)?,
        input_name: row.get(3)?,
        status,
        compute_handle,
        failure_reason: row.get(6)?,
        failure_detail: row.get(7)?,
        result_summary_json: row.get(8)?,
        created_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
        completed_at_ms: row.get(11)?,
    })
}

fn read_event_row(row: &rusqlite::Row<'_>) -> Result<JobEventRow, rusqlite::Error> {
    Ok(JobEventRow {
        seq: row.get(0)?,
        job_id: row.get(1)?,
        ts_ms: row.get(2)?,
        kind: row.get(3)?,
        from_status: row.get(4)?,
        to_status: row.get(5)?,
        message: row.get(6)?,
        meta_json: row.get(7)?,
    })
}

fn get_job_tx(tx: &Transaction<'_>, job_id: &JobId) -> Result<Option<JobRecord>, StoreError> {
    Ok(tx
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id=?1"),
            params![job_id.as_str()],
            read_job_row,
        )
        .optional()?)
}

struct InsertJobEventTxArgs<'a> {
    ts_ms: i64,
    kind: &'a str,
    from_status: Option<JobStatus>,
    to_status: JobStatus,
    message: &'a str,
    meta_json: Option<String>,
}

fn insert_job_event_tx(
    tx: &Transaction<'_>,
    job_id: &JobId,
    args: InsertJobEventTxArgs<'_>,
) -> Result<JobEventRow, StoreError> {
    let message: String = {
        let trimmed = args.message.trim();
        let trimmed = if trimmed.is_empty() { args.kind } else { trimmed };
        trimmed.chars().take(MAX_EVENT_MESSAGE_LEN).collect()
    };
    let from_status = args.from_status.map(JobStatus::as_string);
    let to_status = args.to_status.as_string();

    tx.execute(
        r#"
        INSERT INTO job_events(job_id, ts_ms, kind, from_status, to_status, message, meta_json)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            job_id.as_str(),
            args.ts_ms,
            args.kind,
            from_status,
            to_status,
            message,
            args.meta_json
        ],
    )?;

    Ok(JobEventRow {
        seq: tx.last_insert_rowid(),
        job_id: job_id.as_str().to_string(),
        ts_ms: args.ts_ms,
        kind: args.kind.to_string(),
        from_status,
        to_status,
        message,
        meta_json: args.meta_json,
    })
}

fn normalize_optional(raw: Option<String>, max_len: usize) -> Option<String> {
    raw.map(|s| s.trim().chars().take(max_len).collect::<String>())
        .filter(|s| !s.is_empty())
}

/// Column-level invariants. Sequencing is the caller's business.
fn validate_transition_fields(
    new_status: JobStatus,
    fields: &TransitionFields,
) -> Result<(), StoreError> {
    let has_reason = fields
        .failure_reason
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty());
    match (new_status == JobStatus::Failed, has_reason) {
        (true, false) => {
            return Err(StoreError::InvalidInput(
                "failure_reason is required when status is FAILED",
            ));
        }
        (false, true) => {
            return Err(StoreError::InvalidInput(
                "failure_reason is only allowed when status is FAILED",
            ));
        }
        _ => {}
    }

    let has_summary = fields.result_summary_json.is_some();
    match (new_status == JobStatus::Completed, has_summary) {
        (true, false) => Err(StoreError::InvalidInput(
            "result_summary is required when status is COMPLETED",
        )),
        (false, true) => Err(StoreError::InvalidInput(
            "result_summary is only allowed when status is COMPLETED",
        )),
        _ => Ok(()),
    }
}

fn ensure_handle_compatible(
    job: &JobRecord,
    attempted: Option<&ComputeHandle>,
) -> Result<(), StoreError> {
    if let (Some(existing), Some(attempted)) = (job.compute_handle.as_ref(), attempted)
        && existing != attempted
    {
        return Err(StoreError::ComputeHandleConflict {
            job_id: job.job_id.as_str().to_string(),
            existing: existing.as_str().to_string(),
            attempted: attempted.as_str().to_string(),
        });
    }
    Ok(())
}

impl SqliteStore {
    /// Inserts the record unless one already exists for `job_id`.
    ///
    /// The existing record is returned untouched on conflict, so a redelivered
    /// notification observes exactly what the first delivery wrote.
    pub fn create_if_absent(
        &mut self,
        request: JobCreateRequest,
    ) -> Result<JobCreateResult, StoreError> {
        let input_reference = request.input_reference.trim().to_string();
        if input_reference.is_empty() {
            return Err(StoreError::InvalidInput("input_reference must not be empty"));
        }
        if input_reference.len() > MAX_INPUT_REFERENCE_LEN {
            return Err(StoreError::InvalidInput("input_reference is too long"));
        }
        let input_name = request.input_name.trim().to_string();
        if input_name.is_empty() {
            return Err(StoreError::InvalidInput("input_name must not be empty"));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            r#"
            INSERT INTO jobs(
              job_id, revision, input_reference, input_name, status, compute_handle,
              failure_reason, failure_detail, result_summary_json, created_at_ms, updated_at_ms, completed_at_ms
            )
            VALUES (?1, 0, ?2, ?3, ?4, NULL, NULL, NULL, NULL, ?5, ?5, NULL)
            ON CONFLICT(job_id) DO NOTHING
            "#,
            params![
                request.job_id.as_str(),
                input_reference,
                input_name,
                JobStatus::Submitted.as_string(),
                request.now_ms,
            ],
        )?;

        if inserted == 1 {
            let mut meta = JsonMap::<String, JsonValue>::new();
            meta.insert(
                "input_reference".to_string(),
                JsonValue::String(input_reference.clone()),
            );
            insert_job_event_tx(
                &tx,
                &request.job_id,
                InsertJobEventTxArgs {
                    ts_ms: request.now_ms,
                    kind: "created",
                    from_status: None,
                    to_status: JobStatus::Submitted,
                    message: "created",
                    meta_json: Some(JsonValue::Object(meta).to_string()),
                },
            )?;
        }

        let job = get_job_tx(&tx, &request.job_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;

        Ok(JobCreateResult {
            job,
            created: inserted == 1,
        })
    }

    /// Moves the record to `new_status` iff its current status is in `expected`.
    pub fn compare_and_set_status(
        &mut self,
        request: JobTransitionRequest,
    ) -> Result<TransitionOutcome, StoreError> {
        if request.expected.is_empty() {
            return Err(StoreError::InvalidInput("expected status set must not be empty"));
        }
        let mut fields = request.fields;
        fields.failure_reason = normalize_optional(fields.failure_reason, MAX_EVENT_MESSAGE_LEN);
        fields.failure_detail = normalize_optional(fields.failure_detail, MAX_FAILURE_DETAIL_LEN);
        validate_transition_fields(request.new_status, &fields)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = get_job_tx(&tx, &request.job_id)? else {
            return Err(StoreError::UnknownId);
        };

        if !request.expected.contains(&current.status) {
            tx.commit()?;
            return Ok(TransitionOutcome::Rejected { current });
        }
        ensure_handle_compatible(&current, fields.compute_handle.as_ref())?;

        let updated_at_ms = current.updated_at_ms.max(request.now_ms);
        let completed_at_ms = if request.new_status.is_terminal() {
            Some(updated_at_ms)
        } else {
            current.completed_at_ms
        };
        let handle = fields
            .compute_handle
            .as_ref()
            .map(|h| h.as_str().to_string());

        let changed = tx.execute(
            r#"
            UPDATE jobs
            SET revision=?3, status=?4, compute_handle=COALESCE(compute_handle, ?5),
                failure_reason=?6, failure_detail=?7, result_summary_json=?8,
                updated_at_ms=?9, completed_at_ms=?10
            WHERE job_id=?1 AND revision=?2
            "#,
            params![
                request.job_id.as_str(),
                current.revision,
                current.revision + 1,
                request.new_status.as_string(),
                handle,
                fields.failure_reason,
                fields.failure_detail,
                fields.result_summary_json,
                updated_at_ms,
                completed_at_ms,
            ],
        )?;
        if changed != 1 {
            // Unreachable under an immediate transaction; kept as a hard guard.
            return Err(StoreError::InvalidInput("job revision changed during transition"));
        }

        let mut meta = JsonMap::<String, JsonValue>::new();
        if let Some(handle) = handle.as_deref()
            && current.compute_handle.is_none()
        {
            meta.insert(
                "compute_handle".to_string(),
                JsonValue::String(handle.to_string()),
            );
        }
        if let Some(reason) = fields.failure_reason.as_deref() {
            meta.insert(
                "failure_reason".to_string(),
                JsonValue::String(reason.to_string()),
            );
        }
        let event = insert_job_event_tx(
            &tx,
            &request.job_id,
            InsertJobEventTxArgs {
                ts_ms: updated_at_ms,
                kind: "transition",
                from_status: Some(current.status),
                to_status: request.new_status,
                message: &request.message,
                meta_json: (!meta.is_empty()).then(|| JsonValue::Object(meta).to_string()),
            },
        )?;

        let job = get_job_tx(&tx, &request.job_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(TransitionOutcome::Applied { job, event })
    }

    /// Records the backend handle without touching status.
    ///
    /// Used when a concurrent writer moved the record past SUBMITTED before the
    /// dispatcher could. Re-attaching the same handle is a no-op.
    pub fn attach_compute_handle(
        &mut self,
        job_id: &JobId,
        handle: &ComputeHandle,
        now_ms: i64,
    ) -> Result<JobRecord, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = get_job_tx(&tx, job_id)? else {
            return Err(StoreError::UnknownId);
        };
        ensure_handle_compatible(&current, Some(handle))?;
        if current.compute_handle.is_some() {
            tx.commit()?;
            return Ok(current);
        }

        let updated_at_ms = current.updated_at_ms.max(now_ms);
        tx.execute(
            r#"
            UPDATE jobs
            SET revision=?3, compute_handle=?4, updated_at_ms=?5
            WHERE job_id=?1 AND revision=?2 AND compute_handle IS NULL
            "#,
            params![
                job_id.as_str(),
                current.revision,
                current.revision + 1,
                handle.as_str(),
                updated_at_ms
            ],
        )?;

        let mut meta = JsonMap::<String, JsonValue>::new();
        meta.insert(
            "compute_handle".to_string(),
            JsonValue::String(handle.as_str().to_string()),
        );
        insert_job_event_tx(
            &tx,
            job_id,
            InsertJobEventTxArgs {
                ts_ms: updated_at_ms,
                kind: "handle_attached",
                from_status: Some(current.status),
                to_status: current.status,
                message: "compute handle attached",
                meta_json: Some(JsonValue::Object(meta).to_string()),
            },
        )?;

        let job = get_job_tx(&tx, job_id)?.ok_or(StoreError::UnknownId)?;
        tx.commit()?;
        Ok(job)
    }

    pub fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id=?1"),
                params![job_id.as_str()],
                read_job_row,
            )
            .optional()?)
    }

    pub fn find_by_compute_handle(
        &self,
        handle: &ComputeHandle,
    ) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE compute_handle=?1"),
                params![handle.as_str()],
                read_job_row,
            )
            .optional()?)
    }

    pub fn list(&self, request: JobsListRequest) -> Result<JobsListResult, StoreError> {
        let limit = request.limit.clamp(1, MAX_LIST_LIMIT);
        let fetch = to_sqlite_i64(limit + 1)?;
        let offset = to_sqlite_i64(request.offset)?;

        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(status) = request.status {
            sql.push_str(" WHERE status=?1");
            args.push(status.as_string().into());
        }
        sql.push_str(&format!(
            " ORDER BY created_at_ms ASC, job_id ASC LIMIT ?{} OFFSET ?{}",
            args.len() + 1,
            args.len() + 2
        ));
        args.push(fetch.into());
        args.push(offset.into());

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), read_job_row)?;
        let mut jobs = rows.collect::<Result<Vec<_>, _>>()?;
        let has_more = jobs.len() > limit;
        jobs.truncate(limit);
        Ok(JobsListResult { jobs, has_more })
    }

    pub fn status_counts(&self) -> Result<Vec<StatusCount>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(1) FROM jobs GROUP BY status ORDER BY status ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(StatusCount {
                status: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Non-terminal records whose last write is older than `updated_before_ms`,
    /// oldest first.
    pub fn stale_jobs(
        &self,
        updated_before_ms: i64,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let limit = to_sqlite_i64(limit.clamp(1, MAX_LIST_LIMIT))?;
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status NOT IN ('COMPLETED', 'FAILED') AND updated_at_ms < ?1
            ORDER BY updated_at_ms ASC, job_id ASC
            LIMIT ?2
            "#
        ))?;
        let rows = stmt.query_map(params![updated_before_ms, limit], read_job_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Audit trail of a job, oldest first.
    pub fn job_events(&self, job_id: &JobId, limit: usize) -> Result<Vec<JobEventRow>, StoreError> {
        let limit = to_sqlite_i64(limit.clamp(1, MAX_LIST_LIMIT))?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT seq, job_id, ts_ms, kind, from_status, to_status, message, meta_json
            FROM job_events
            WHERE job_id=?1
            ORDER BY seq ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![job_id.as_str(), limit], read_event_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
