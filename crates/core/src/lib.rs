#![forbid(unsafe_code)]

pub mod events;
pub mod ids;
pub mod manifest;
pub mod model;

pub use ids::{ComputeHandle, IdError, JobId, StorageKey};
pub use model::{DEFAULT_STAGE_COUNT, FailureClass, JobStatus, OutOfOrderPolicy, StageId};
