#![forbid(unsafe_code)]

use bf_core::ComputeHandle;
use bf_core::events::ComputeSubmission;
use serde::Deserialize;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// `EX_TEMPFAIL` from sysexits.h: the submit command asks to be retried.
pub const EXIT_TEMPFAIL: i32 = 75;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendError {
    /// Worth another attempt (throttling, network, lock contention).
    Transient(String),
    /// The backend refused the request; retrying will not help.
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(message) => write!(f, "transient backend error: {message}"),
            Self::Rejected(message) => write!(f, "backend rejected submission: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Asynchronous job-running service. Submission returns as soon as the
/// backend has accepted the work; completion is reported out of band.
pub trait ComputeBackend: Send + Sync {
    fn submit(&self, submission: &ComputeSubmission) -> Result<ComputeHandle, BackendError>;
}

/// Accepts everything without calling out. Useful for smoke runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct DryRunBackend;

impl ComputeBackend for DryRunBackend {
    fn submit(&self, submission: &ComputeSubmission) -> Result<ComputeHandle, BackendError> {
        ComputeHandle::try_new(format!("dryrun-{}", submission.job_id))
            .map_err(|err| BackendError::Rejected(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    compute_handle: String,
}

/// Delegates submission to an external program (a scheduler CLI wrapper).
///
/// The submission JSON is written to the program's stdin; the program prints
/// `{"compute_handle": "..."}` on stdout and exits 0.
#[derive(Clone, Debug)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn run(&self, payload: &[u8]) -> Result<(i32, String, String), BackendError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BackendError::Transient(format!("failed to spawn {}: {e}", self.program))
            })?;

        feed_stdin(&mut child, payload)?;

        let stdout_reader = child.stdout.take().map(|mut out| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BackendError::Transient(format!(
                        "submit command timed out after {}ms",
                        self.timeout.as_millis()
                    )));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(BackendError::Transient(format!(
                        "wait for submit command failed: {e}"
                    )));
                }
            }
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        // Killed by a signal: treat like a transient failure.
        let code = status.code().unwrap_or(EXIT_TEMPFAIL);
        Ok((code, stdout, stderr))
    }
}

/// Writes `payload` and closes stdin. On failure the child is killed and
/// reaped before the error is returned.
fn feed_stdin(child: &mut Child, payload: &[u8]) -> Result<(), BackendError> {
    let Some(mut stdin) = child.stdin.take() else {
        return Ok(());
    };
    if let Err(e) = stdin.write_all(payload) {
        drop(stdin);
        let _ = child.kill();
        let _ = child.wait();
        return Err(BackendError::Transient(format!(
            "write submit stdin failed: {e}"
        )));
    }
    Ok(())
}

impl ComputeBackend for CommandBackend {
    fn submit(&self, submission: &ComputeSubmission) -> Result<ComputeHandle, BackendError> {
        let payload = serde_json::to_vec(submission)
            .map_err(|e| BackendError::Rejected(format!("encode submission failed: {e}")))?;
        let (code, stdout, stderr) = self.run(&payload)?;

        let stderr_tail = tail(&stderr, 400);
        match code {
            0 => {}
            EXIT_TEMPFAIL => {
                return Err(BackendError::Transient(format!(
                    "submit command asked for retry: {stderr_tail}"
                )));
            }
            other => {
                return Err(BackendError::Rejected(format!(
                    "submit command exited with {other}: {stderr_tail}"
                )));
            }
        }

        let reply: SubmitReply = serde_json::from_str(stdout.trim()).map_err(|e| {
            BackendError::Rejected(format!("submit command printed invalid reply: {e}"))
        })?;
        ComputeHandle::try_new(reply.compute_handle)
            .map_err(|e| BackendError::Rejected(format!("invalid compute_handle: {e}")))
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_core::events::SubmissionParameters;
    use bf_core::{JobId, StorageKey};

    fn submission() -> ComputeSubmission {
        let key = StorageKey::try_new("targets/abc.pdb").expect("key");
        let job_id = JobId::derive(&key);
        ComputeSubmission::new(
            &job_id,
            "registry.local/binder:latest",
            SubmissionParameters {
                input_reference: "targets/abc.pdb".to_string(),
                output_prefix: format!("results/{job_id}/"),
                input_name: "abc".to_string(),
            },
        )
    }

    fn sh(script: &str) -> CommandBackend {
        CommandBackend::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(10),
        )
    }

    #[test]
    fn dry_run_derives_handle_from_job() {
        let sub = submission();
        let handle = DryRunBackend.submit(&sub).expect("submit");
        assert_eq!(handle.as_str(), format!("dryrun-{}", sub.job_id));
    }

    #[cfg(unix)]
    #[test]
    fn command_backend_reads_handle_from_stdout() {
        let backend = sh(r#"cat >/dev/null; echo '{"compute_handle":"batch-123"}'"#);
        let handle = backend.submit(&submission()).expect("submit");
        assert_eq!(handle.as_str(), "batch-123");
    }

    #[cfg(unix)]
    #[test]
    fn command_backend_receives_submission_on_stdin() {
        let backend = sh(
            r#"grep -q '"client_token":"JOB-' && echo '{"compute_handle":"seen-token"}' || exit 3"#,
        );
        let handle = backend.submit(&submission()).expect("submit");
        assert_eq!(handle.as_str(), "seen-token");
    }

    #[cfg(unix)]
    #[test]
    fn command_backend_classifies_exit_codes() {
        let transient = sh("cat >/dev/null; echo throttled >&2; exit 75")
            .submit(&submission())
            .expect_err("tempfail");
        assert!(transient.is_transient(), "{transient}");

        let rejected = sh("cat >/dev/null; echo 'bad queue' >&2; exit 2")
            .submit(&submission())
            .expect_err("rejected");
        assert!(!rejected.is_transient());
        assert!(rejected.to_string().contains("bad queue"));

        let garbage = sh("cat >/dev/null; echo not-json")
            .submit(&submission())
            .expect_err("bad reply");
        assert!(matches!(garbage, BackendError::Rejected(_)));
    }

    #[cfg(unix)]
    #[test]
    fn command_backend_times_out() {
        let backend = CommandBackend::new(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );
        let err = backend.submit(&submission()).expect_err("timeout");
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn stdin_write_failure_reaps_the_child() {
        let mut child = Command::new("sh")
            .args(["-c", "exec 0<&-; sleep 30"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn");
        // Larger than a pipe buffer, so the write cannot finish before the
        // child closes its end.
        let payload = vec![b'x'; 4 << 20];
        let started = Instant::now();
        let err = feed_stdin(&mut child, &payload).expect_err("broken pipe");
        assert!(err.is_transient(), "{err}");
        assert!(
            child.try_wait().expect("try_wait").is_some(),
            "child must already be reaped"
        );
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn missing_program_is_transient() {
        let backend = CommandBackend::new(
            "/nonexistent/bf-submit",
            Vec::new(),
            Duration::from_secs(1),
        );
        assert!(backend.submit(&submission()).expect_err("spawn").is_transient());
    }
}
