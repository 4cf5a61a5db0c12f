#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};

const JOB_ID_PREFIX: &str = "JOB-";
const JOB_ID_HEX_LEN: usize = 20;
const MAX_STORAGE_KEY_LEN: usize = 1024;
const MAX_COMPUTE_HANDLE_LEN: usize = 256;

/// Ledger key of a job.
///
/// Derived from the storage key of the triggering artifact, so every
/// redelivery of the same notification lands on the same record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn derive(key: &StorageKey) -> Self {
        let digest = Sha256::digest(key.as_str().as_bytes());
        let mut out = String::with_capacity(JOB_ID_PREFIX.len() + JOB_ID_HEX_LEN);
        out.push_str(JOB_ID_PREFIX);
        for byte in digest.iter().take(JOB_ID_HEX_LEN / 2) {
            out.push_str(&format!("{byte:02x}"));
        }
        Self(out)
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_job_id(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_storage_key(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment of the key.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// File name without its last extension.
    pub fn file_stem(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => name,
            Some(idx) => &name[..idx],
        }
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComputeHandle(String);

impl ComputeHandle {
    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }
        if trimmed.len() > MAX_COMPUTE_HANDLE_LEN {
            return Err(IdError::TooLong);
        }
        if trimmed.chars().any(|c| c.is_control()) {
            return Err(IdError::ContainsControl);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComputeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdError {
    Empty,
    TooLong,
    ContainsControl,
    LeadingSlash,
    InvalidJobPrefix,
    InvalidJobDigest,
}

impl IdError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "identifier must not be empty",
            Self::TooLong => "identifier is too long",
            Self::ContainsControl => "identifier contains control characters",
            Self::LeadingSlash => "storage key must not start with '/'",
            Self::InvalidJobPrefix => "job id must start with JOB-",
            Self::InvalidJobDigest => "job id must end with 20 lowercase hex characters",
        }
    }
}

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for IdError {}

fn validate_job_id(value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    let Some(digest) = value.strip_prefix(JOB_ID_PREFIX) else {
        return Err(IdError::InvalidJobPrefix);
    };
    if digest.len() != JOB_ID_HEX_LEN
        || !digest
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, 'a'..='f'))
    {
        return Err(IdError::InvalidJobDigest);
    }
    Ok(())
}

fn validate_storage_key(value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_STORAGE_KEY_LEN {
        return Err(IdError::TooLong);
    }
    if value.starts_with('/') {
        return Err(IdError::LeadingSlash);
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(IdError::ContainsControl);
    }
    Ok(())
}
