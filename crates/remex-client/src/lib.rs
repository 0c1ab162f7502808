pub mod batching;
pub mod classify;
pub mod engine;
pub mod error;
mod monitor;
pub mod options;
pub mod registry;
pub mod reunion;
pub mod scheduler;
mod submission;

pub use batching::{
    ArrayerConfig, Batcher, BatcherFactory, JobArrayer, PendingSubmission, SubmissionSink,
};
pub use classify::{classify, rederive_success, Classification, FailureCause};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result, SubmissionConfigError};
pub use options::{resolve_options, Identity, ResolvedOptions};
pub use registry::PendingRegistry;
pub use reunion::ReunionCache;
pub use scheduler::Scheduler;
