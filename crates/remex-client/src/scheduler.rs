use crate::error::EngineError;
use remex_core::errors::{JobError, Traceback};
use remex_core::model::{JobTags, LogicalJob};
use serde_json::Value;
use std::sync::Arc;
use tracing::Level;

/// Callbacks into the scheduler that owns the logical jobs.
///
/// Each submitted job receives exactly one of `done_job` or `reject_job`,
/// unless the engine fails first through `reject_executor`.
pub trait Scheduler: Send + Sync {
    fn done_job(&self, job: &Arc<LogicalJob>, result: Value, tags: &JobTags);

    fn reject_job(
        &self,
        job: &Arc<LogicalJob>,
        error: JobError,
        traceback: Traceback,
        tags: &JobTags,
    );

    /// Engine-level failure not attributable to one job.
    fn reject_executor(&self, error: EngineError);

    fn log(&self, message: &str, level: Level);

    fn is_valid_value(&self, _value: &Value) -> bool {
        true
    }
}
