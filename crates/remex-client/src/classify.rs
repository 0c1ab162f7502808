use crate::error::Result;
use remex_core::constants::{markers, payloads};
use remex_core::model::{BackendKind, LogicalJob};
use remex_executor::{RemoteState, Scratch, ScratchKey, StatusRecord};

/// Recognized reasons behind a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The agent lost track of the container; the task itself may well
    /// have finished.
    TransientInspect,
    Timeout,
    Unrecognized,
}

#[derive(Debug, Clone, Copy)]
enum ReasonField {
    Container,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    /// Trust the job's own status marker or output over the failure flag.
    Override,
    Fail,
}

const CAUSES: &[(ReasonField, &str, FailureCause, Policy)] = &[
    (
        ReasonField::Container,
        "CannotInspectContainerError",
        FailureCause::TransientInspect,
        Policy::Override,
    ),
    (
        ReasonField::Status,
        "Job attempt duration exceeded timeout",
        FailureCause::Timeout,
        Policy::Fail,
    ),
];

impl FailureCause {
    pub fn of(record: &StatusRecord) -> Self {
        lookup(record).map_or(FailureCause::Unrecognized, |(cause, _)| cause)
    }

    pub fn overrides_failure(&self) -> bool {
        CAUSES
            .iter()
            .any(|(_, _, cause, policy)| cause == self && *policy == Policy::Override)
    }
}

fn lookup(record: &StatusRecord) -> Option<(FailureCause, Policy)> {
    CAUSES.iter().find_map(|(field, needle, cause, policy)| {
        let text = match field {
            ReasonField::Container => record.container_reason.as_deref(),
            ReasonField::Status => record.status_reason.as_deref(),
        };
        text.filter(|t| t.contains(*needle))
            .map(|_| (*cause, *policy))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NotTerminal,
    Succeeded {
        /// The remote reported failure, but the job's own artifacts show
        /// it completed.
        overridden: bool,
    },
    Failed {
        cause: FailureCause,
    },
}

impl Classification {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Classification::NotTerminal)
    }
}

/// Whether the job completed according to what it left in scratch: the
/// status marker for script tasks, output presence otherwise.
pub async fn rederive_success(job: &LogicalJob, scratch: &dyn Scratch) -> Result<bool> {
    if job.is_script() {
        let key = ScratchKey::job(&job.eval_hash, payloads::STATUS);
        let marker = scratch.read_if_exists(&key).await?;
        Ok(marker.is_some_and(|m| String::from_utf8_lossy(&m).trim() == markers::OK))
    } else {
        let key = ScratchKey::job(&job.eval_hash, payloads::OUTPUT);
        Ok(scratch.exists(&key).await?)
    }
}

pub async fn classify(
    record: &StatusRecord,
    kind: BackendKind,
    job: &LogicalJob,
    scratch: &dyn Scratch,
) -> Result<Classification> {
    let state = record.state();
    if !state.is_terminal() {
        return Ok(Classification::NotTerminal);
    }

    let cause = FailureCause::of(record);

    if kind.is_local() {
        return Ok(if rederive_success(job, scratch).await? {
            Classification::Succeeded { overridden: false }
        } else {
            Classification::Failed { cause }
        });
    }

    if state == RemoteState::Succeeded {
        return Ok(Classification::Succeeded { overridden: false });
    }

    if cause.overrides_failure() {
        if rederive_success(job, scratch).await? {
            tracing::warn!(
                "Remote job {} for '{}' reported failure ({:?}) but its output is present; treating as success",
                record.id,
                job.id,
                cause
            );
            return Ok(Classification::Succeeded { overridden: true });
        }
        return Ok(Classification::Failed {
            cause: FailureCause::Unrecognized,
        });
    }
    Ok(Classification::Failed { cause })
}
