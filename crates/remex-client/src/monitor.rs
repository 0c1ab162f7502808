use crate::classify::{classify, Classification, FailureCause};
use crate::engine::EngineInner;
use crate::error::{EngineError, Result};
use remex_core::constants::{logs, payloads, tags};
use remex_core::errors::{JobError, Traceback};
use remex_core::model::{JobTags, LogicalJob};
use remex_executor::{ScratchKey, StatusRecord};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::Level;

/// Error document written by the oneshot runner when a task raises.
#[derive(Debug, Deserialize)]
struct TaskErrorPayload {
    error: String,
    #[serde(default)]
    traceback: Vec<String>,
}

pub(crate) async fn run(inner: Arc<EngineInner>) {
    if let Err(e) = monitor_loop(&inner).await {
        tracing::error!("Job monitor failed: {}", e);
        inner
            .scheduler
            .log(&format!("Job monitor failed: {}", e), Level::ERROR);
        inner.scheduler.reject_executor(e);
        inner.stop();
    }
}

async fn monitor_loop(inner: &Arc<EngineInner>) -> Result<()> {
    let interval = inner.config.monitor_interval();
    loop {
        if inner.cancel.is_cancelled() || inner.try_go_idle() {
            return Ok(());
        }
        poll_once(inner).await?;
        tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Describes the pending jobs oldest first and reports those that reached
/// a terminal state. With `pending_truncate` set, polling stops early after
/// that many consecutive jobs that have not started yet.
pub(crate) async fn poll_once(inner: &EngineInner) -> Result<()> {
    let ids = inner.registry.ids_in_order();
    if ids.is_empty() {
        return Ok(());
    }
    let truncate = inner.config.pending_truncate;
    let mut not_started = 0usize;

    for chunk in ids.chunks(inner.config.describe_chunk_size) {
        let records = inner.client.describe(chunk).await?;
        tracing::debug!(
            "Polled {} of {} pending jobs, {} records returned",
            chunk.len(),
            ids.len(),
            records.len()
        );

        for record in &records {
            let Some(job) = inner.registry.get(&record.id) else {
                continue;
            };
            let classification =
                classify(record, inner.kind(), &job, inner.scratch.as_ref()).await?;
            if classification.is_terminal() {
                not_started = 0;
                report_outcome(inner, record, classification).await?;
            } else if record.started {
                not_started = 0;
            } else {
                not_started += 1;
            }
        }

        if truncate > 0 && not_started > truncate {
            tracing::debug!(
                "Stopping poll after {} consecutive jobs not yet started",
                not_started
            );
            break;
        }
    }
    Ok(())
}

fn job_tags(inner: &EngineInner, record: &StatusRecord) -> JobTags {
    let mut out = JobTags::new();
    if !inner.kind().is_local() {
        out.push((tags::REMOTE_JOB.to_string(), record.id.to_string()));
    }
    if inner.config.observability_tags {
        if let Some(stream) = &record.log_stream {
            out.push((tags::LOG_STREAM.to_string(), stream.clone()));
        }
    }
    out
}

/// Reports the outcome of a terminal record. The registry entry is removed
/// first, so an id is reported at most once.
pub(crate) async fn report_outcome(
    inner: &EngineInner,
    record: &StatusRecord,
    classification: Classification,
) -> Result<()> {
    let Some(job) = inner.registry.remove(&record.id) else {
        return Ok(());
    };
    let job_tags = job_tags(inner, record);

    match classification {
        Classification::NotTerminal => {
            return Err(EngineError::Fatal(format!(
                "asked to report non-terminal job {}",
                record.id
            )))
        }
        Classification::Succeeded { overridden } => {
            if overridden {
                let reason = record
                    .container_reason
                    .as_deref()
                    .or(record.status_reason.as_deref())
                    .unwrap_or("unknown");
                inner.scheduler.log(
                    &format!(
                        "NOTE: Overriding {} error: {}",
                        inner.kind().describe_job_type(),
                        reason
                    ),
                    Level::WARN,
                );
            }
            let key = ScratchKey::job(&job.eval_hash, payloads::OUTPUT);
            match read_output(inner, &job, &key).await? {
                Some(value) => {
                    tracing::debug!("Job '{}' succeeded as {}", job.id, record.id);
                    inner.scheduler.done_job(&job, value, &job_tags);
                }
                None => {
                    let error = JobError::MissingOutput {
                        location: inner.scratch.location(&key),
                    };
                    let mut traceback = Traceback::from_error(&error);
                    traceback.logs = collect_logs(inner, record).await;
                    inner.scheduler.reject_job(&job, error, traceback, &job_tags);
                }
            }
        }
        Classification::Failed { cause } => {
            let (error, frames) = parse_task_error(inner, &job, record, cause).await?;
            let traceback = Traceback {
                frames,
                logs: collect_logs(inner, record).await,
            };
            tracing::debug!("Job '{}' failed as {}: {}", job.id, record.id, error);
            inner.scheduler.reject_job(&job, error, traceback, &job_tags);
        }
    }
    Ok(())
}

/// Output of a finished job, or `None` when it is absent or not acceptable
/// to the scheduler. Script output is the captured stdout.
async fn read_output(
    inner: &EngineInner,
    job: &LogicalJob,
    key: &ScratchKey,
) -> Result<Option<Value>> {
    let Some(data) = inner.scratch.read_if_exists(key).await? else {
        return Ok(None);
    };
    let value = if job.is_script() {
        Value::String(String::from_utf8_lossy(&data).into_owned())
    } else {
        match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Output of job '{}' is not valid JSON: {}", job.id, e);
                return Ok(None);
            }
        }
    };
    if inner.config.validate_output && !inner.scheduler.is_valid_value(&value) {
        tracing::warn!("Output of job '{}' was rejected by the scheduler", job.id);
        return Ok(None);
    }
    Ok(Some(value))
}

async fn parse_task_error(
    inner: &EngineInner,
    job: &LogicalJob,
    record: &StatusRecord,
    cause: FailureCause,
) -> Result<(JobError, Vec<String>)> {
    let key = ScratchKey::job(&job.eval_hash, payloads::ERROR);
    if let Some(data) = inner.scratch.read_if_exists(&key).await? {
        if job.is_script() {
            let error = JobError::Script {
                stderr: String::from_utf8_lossy(&data).into_owned(),
            };
            let frames = vec![error.to_string()];
            return Ok((error, frames));
        }
        if let Ok(payload) = serde_json::from_slice::<TaskErrorPayload>(&data) {
            return Ok((
                JobError::Task {
                    error: payload.error,
                },
                payload.traceback,
            ));
        }
        let error = JobError::Task {
            error: String::from_utf8_lossy(&data).into_owned(),
        };
        let frames = vec![error.to_string()];
        return Ok((error, frames));
    }

    let error = match cause {
        FailureCause::Timeout => JobError::Timeout {
            reason: record
                .status_reason
                .clone()
                .unwrap_or_else(|| JobError::timeout().to_string()),
        },
        _ => JobError::RemoteFailure {
            reason: record
                .status_reason
                .clone()
                .or_else(|| record.container_reason.clone())
                .unwrap_or_else(|| "unknown reason".to_string()),
        },
    };
    let frames = vec![error.to_string()];
    Ok((error, frames))
}

/// Header, failure reasons, then the tail of the job's logs. Log retrieval
/// problems end up in the returned lines rather than failing the report.
pub(crate) async fn collect_logs(inner: &EngineInner, record: &StatusRecord) -> Vec<String> {
    let kind = inner.kind();
    let max_lines = inner.config.log_tail_lines;
    let mut out = vec![format!(
        "*** Logs for {} {} ({}):",
        kind.describe_job_type(),
        record.id,
        record.name
    )];
    if let Some(reason) = &record.container_reason {
        out.push(format!("container.reason: {}", reason));
    }
    if let Some(reason) = &record.status_reason {
        out.push(format!("statusReason: {}", reason));
    }

    let lines: Vec<String> = match &record.logs {
        Some(inline) => inline.lines().map(str::to_string).collect(),
        None => match inner.client.log_tail(&record.id, max_lines + 1).await {
            Ok(lines) => lines,
            Err(e) => {
                out.push(format!("<failed to fetch logs: {}>", e));
                return out;
            }
        },
    };
    if lines.len() > max_lines {
        out.push(logs::TRUNCATED.to_string());
        out.extend(lines[lines.len() - max_lines..].iter().cloned());
    } else {
        out.extend(lines);
    }
    out
}
