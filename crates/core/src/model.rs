#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub const DEFAULT_STAGE_COUNT: u8 = 3;

/// One of the opaque compute stages, numbered from 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct StageId(u8);

impl StageId {
    pub fn new(index: u8) -> Option<Self> {
        (index >= 1).then_some(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// `STAGE_1..=STAGE_<stage_count>`.
    pub fn sequence(stage_count: u8) -> impl Iterator<Item = StageId> {
        (1..=stage_count).map(StageId)
    }

    pub fn label(self) -> String {
        format!("STAGE_{}", self.0)
    }
}

impl TryFrom<u8> for StageId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        StageId::new(value).ok_or_else(|| "stage must be >= 1".to_string())
    }
}

impl From<StageId> for u8 {
    fn from(value: StageId) -> Self {
        value.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobStatus {
    Submitted,
    Running,
    StageDone(StageId),
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the forward path. Terminal states rank above every stage.
    pub fn rank(self) -> u32 {
        match self {
            Self::Submitted => 0,
            Self::Running => 1,
            Self::StageDone(stage) => 1 + u32::from(stage.index()),
            Self::Completed => u32::MAX - 1,
            Self::Failed => u32::MAX,
        }
    }

    /// State the record must be in right before `stage` completes.
    pub fn predecessor_of(stage: StageId) -> Self {
        match StageId::new(stage.index().saturating_sub(1)) {
            Some(previous) => Self::StageDone(previous),
            None => Self::Running,
        }
    }

    pub fn non_terminal(stage_count: u8) -> Vec<Self> {
        let mut out = vec![Self::Submitted, Self::Running];
        out.extend(StageId::sequence(stage_count).map(Self::StageDone));
        out
    }

    pub fn as_string(self) -> String {
        match self {
            Self::Submitted => "SUBMITTED".to_string(),
            Self::Running => "RUNNING".to_string(),
            Self::StageDone(stage) => format!("STAGE_{}_DONE", stage.index()),
            Self::Completed => "COMPLETED".to_string(),
            Self::Failed => "FAILED".to_string(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StatusParseError> {
        let raw = raw.trim();
        match raw.to_ascii_uppercase().as_str() {
            "SUBMITTED" => return Ok(Self::Submitted),
            "RUNNING" => return Ok(Self::Running),
            "COMPLETED" => return Ok(Self::Completed),
            "FAILED" => return Ok(Self::Failed),
            _ => {}
        }
        let upper = raw.to_ascii_uppercase();
        let digits = upper
            .strip_prefix("STAGE_")
            .and_then(|rest| rest.strip_suffix("_DONE"))
            .ok_or_else(|| StatusParseError(raw.to_string()))?;
        digits
            .parse::<u8>()
            .ok()
            .and_then(StageId::new)
            .map(Self::StageDone)
            .ok_or_else(|| StatusParseError(raw.to_string()))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl TryFrom<String> for JobStatus {
    type Error = StatusParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        value.as_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusParseError(pub String);

impl std::fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown job status: {}", self.0)
    }
}

impl std::error::Error for StatusParseError {}

/// Classification written to `failure_reason`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    SubmissionError,
    ResourceCapacity,
    StageError,
    Timeout,
    ManifestError,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubmissionError => "submission_error",
            Self::ResourceCapacity => "resource_capacity",
            Self::StageError => "stage_error",
            Self::Timeout => "timeout",
            Self::ManifestError => "manifest_error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "submission_error" => Some(Self::SubmissionError),
            "resource_capacity" => Some(Self::ResourceCapacity),
            "stage_error" => Some(Self::StageError),
            "timeout" => Some(Self::Timeout),
            "manifest_error" => Some(Self::ManifestError),
            _ => None,
        }
    }

    /// Maps a backend-supplied classification onto the ledger's vocabulary.
    pub fn classify(error_classification: Option<&str>) -> Self {
        let Some(raw) = error_classification.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::StageError;
        };
        if let Some(exact) = Self::parse(raw) {
            return exact;
        }
        let lowered = raw.to_ascii_lowercase();
        const CAPACITY_WORDS: &[&str] = &[
            "capacity",
            "resource",
            "insufficient",
            "out of memory",
            "outofmemory",
            "oom",
            "spot",
            "quota",
            "host terminated",
        ];
        const TIMEOUT_WORDS: &[&str] = &["timeout", "timed out", "timed_out", "deadline"];
        if CAPACITY_WORDS.iter().any(|w| lowered.contains(w)) {
            return Self::ResourceCapacity;
        }
        if TIMEOUT_WORDS.iter().any(|w| lowered.contains(w)) {
            return Self::Timeout;
        }
        Self::StageError
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the reconciler treats stage signals that arrive out of sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfOrderPolicy {
    /// Only the immediate predecessor state accepts a stage signal.
    InOrder,
    /// Any in-flight state ranked below the target accepts it; older stage
    /// signals arriving later find the record already past them.
    ///
    /// This is wider than "RUNNING or the immediate predecessor": a stage-n
    /// signal also applies from any `STAGE_k_DONE` with `k < n - 1`, so a
    /// dropped intermediate signal never stalls progress.
    #[default]
    SkipAhead,
}

impl OutOfOrderPolicy {
    pub fn accepted_from(self, stage: StageId) -> Vec<JobStatus> {
        match self {
            Self::InOrder => vec![JobStatus::predecessor_of(stage)],
            Self::SkipAhead => {
                let mut out = vec![JobStatus::Running];
                out.extend(
                    StageId::sequence(stage.index().saturating_sub(1)).map(JobStatus::StageDone),
                );
                out
            }
        }
    }
}
