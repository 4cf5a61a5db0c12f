#![forbid(unsafe_code)]

use crate::error::OrchestratorError;
use crate::runtime::Runtime;
use bf_core::events::InboxMessage;
use bf_storage::SqliteStore;
use serde::Serialize;
use serde_json::{Value, json};
use std::io::{BufRead, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InboxStats {
    pub lines: usize,
    pub ok: usize,
    pub failed: usize,
}

/// Handles one inbox line. `None` for blank lines.
pub fn handle_line(
    runtime: &Runtime,
    store: &mut SqliteStore,
    line_no: usize,
    line: &str,
) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let message: InboxMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(line = line_no, error = %err, "malformed inbox message dropped");
            return Some(json!({
                "line": line_no,
                "ok": false,
                "error": format!("malformed message: {err}"),
            }));
        }
    };
    match runtime.handle_message(store, &message) {
        Ok(mut summary) => {
            summary["line"] = json!(line_no);
            summary["ok"] = json!(true);
            Some(summary)
        }
        Err(err) => {
            tracing::error!(line = line_no, error = %err, "inbox message failed");
            Some(json!({
                "line": line_no,
                "ok": false,
                "error": err.to_string(),
            }))
        }
    }
}

/// Reads line-delimited messages from `input` and writes one JSON result line
/// per message to `output`.
///
/// With more than one worker, results are written in completion order; each
/// carries its `line` number.
pub fn run(
    runtime: &Runtime,
    input: impl BufRead,
    output: &mut impl Write,
    workers: usize,
) -> Result<InboxStats, OrchestratorError> {
    let workers = workers.max(1);
    if workers == 1 {
        let mut store = runtime.open_ledger()?;
        let mut stats = InboxStats::default();
        for (idx, line) in input.lines().enumerate() {
            let line = line?;
            if let Some(result) = handle_line(runtime, &mut store, idx + 1, &line) {
                emit(output, &result, &mut stats)?;
            }
        }
        return Ok(stats);
    }

    let stores = (0..workers)
        .map(|_| runtime.open_ledger())
        .collect::<Result<Vec<_>, _>>()?;

    let (work_tx, work_rx) = mpsc::channel::<(usize, String)>();
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (result_tx, result_rx) = mpsc::channel::<Value>();
    let mut stats = InboxStats::default();

    std::thread::scope(|scope| -> Result<(), OrchestratorError> {
        for mut store in stores {
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                loop {
                    let next = match work_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok((line_no, line)) = next else {
                        break;
                    };
                    if let Some(result) = handle_line(runtime, &mut store, line_no, &line)
                        && result_tx.send(result).is_err()
                    {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut read_result = Ok(());
        for (idx, line) in input.lines().enumerate() {
            match line {
                Ok(line) => {
                    if work_tx.send((idx + 1, line)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    read_result = Err(OrchestratorError::Io(err));
                    break;
                }
            }
            while let Ok(result) = result_rx.try_recv() {
                emit(output, &result, &mut stats)?;
            }
        }
        drop(work_tx);

        for result in result_rx.iter() {
            emit(output, &result, &mut stats)?;
        }
        read_result
    })?;

    Ok(stats)
}

fn emit(
    output: &mut impl Write,
    result: &Value,
    stats: &mut InboxStats,
) -> Result<(), OrchestratorError> {
    stats.lines += 1;
    if result["ok"] == json!(true) {
        stats.ok += 1;
    } else {
        stats.failed += 1;
    }
    serde_json::to_writer(&mut *output, result)?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}
