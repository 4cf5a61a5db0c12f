#![forbid(unsafe_code)]

pub mod backend;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inbox;
pub mod manifest;
pub mod object_store;
pub mod reconciler;
pub mod retry;
pub mod runtime;
pub mod status;
pub mod watchdog;

pub use backend::{BackendError, CommandBackend, ComputeBackend, DryRunBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendConfig, BackendKind, ConfigError, OrchestratorConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::OrchestratorError;
pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use retry::{NoopSleeper, RetryPolicy, Sleeper, ThreadSleeper};
pub use runtime::Runtime;
pub use watchdog::{SweepReport, Watchdog};
