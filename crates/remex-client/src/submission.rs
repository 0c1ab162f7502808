use crate::batching::{PendingSubmission, SubmissionSink};
use crate::engine::EngineInner;
use crate::error::{EngineError, Result, SubmissionConfigError};
use crate::options::ResolvedOptions;
use async_trait::async_trait;
use remex_core::constants::{markers, payloads, tags};
use remex_core::errors::{JobError, Traceback};
use remex_core::model::{LogicalJob, RemoteJobId, TaskArgs, TaskKind};
use remex_core::naming::job_name;
use remex_executor::{CodeRef, Scratch, ScratchKey, ShellCommand, SubmitRequest};
use std::sync::Arc;
use tracing::Level;

const TASK_COMMAND_FILE: &str = ".task_command";
const TASK_OUTPUT_FILE: &str = ".task_output";
const TASK_ERROR_FILE: &str = ".task_error";
const TASK_STATUS_FILE: &str = ".task_status";

/// Payload locations handed to the oneshot runner.
struct RunnerPaths {
    input: String,
    output: String,
    error: String,
}

fn runner_command(
    program: &str,
    job: &LogicalJob,
    code: Option<&CodeRef>,
    paths: &RunnerPaths,
    array: bool,
    cache: bool,
) -> Vec<String> {
    let mut command = vec![
        program.to_string(),
        "oneshot".to_string(),
        job.task.module.clone(),
    ];
    if let Some(code) = code {
        command.push("--code".to_string());
        command.push(code.location.clone());
    }
    if array {
        command.push("--array-job".to_string());
    }
    if !cache {
        command.push("--no-cache".to_string());
    }
    command.extend([
        "--input".to_string(),
        paths.input.clone(),
        "--output".to_string(),
        paths.output.clone(),
        "--error".to_string(),
        paths.error.clone(),
        job.task.fullname(),
    ]);
    command
}

/// Bash wrapper running a rendered script: fetches the command from
/// scratch, tees stdout/stderr into files, stores them back and records an
/// `ok`/`fail` status marker. With `exit_on_failure` the wrapper also exits
/// non-zero so the cluster sees the failure.
pub(crate) fn script_wrapper(scratch: &dyn Scratch, job: &LogicalJob, exit_on_failure: bool) -> String {
    let key = |kind: &'static str| ScratchKey::job(&job.eval_hash, kind);
    let fetch = scratch
        .fetch_command(&key(payloads::INPUT), TASK_COMMAND_FILE)
        .and(ShellCommand::new("chmod").arg("+x").arg(TASK_COMMAND_FILE))
        .to_shell_string();
    let store_output = scratch
        .store_command(TASK_OUTPUT_FILE, &key(payloads::OUTPUT))
        .to_shell_string();
    let store_error = scratch
        .store_command(TASK_ERROR_FILE, &key(payloads::ERROR))
        .to_shell_string();
    let store_status = scratch
        .store_command(TASK_STATUS_FILE, &key(payloads::STATUS))
        .to_shell_string();
    let mark = |marker: &str| {
        ShellCommand::new("echo")
            .arg(marker)
            .redirect_out(TASK_STATUS_FILE)
            .to_shell_string()
    };

    format!(
        "set -o pipefail; touch {out} {err}; {fetch} && (./{cmd} 2> >(tee {err} >&2) | tee {out}) \
         && ({store_output} && {store_error} && {ok} && {store_status}) \
         || ({store_output}; {store_error}; {fail}; {store_status}{exit})",
        out = TASK_OUTPUT_FILE,
        err = TASK_ERROR_FILE,
        cmd = TASK_COMMAND_FILE,
        ok = mark(markers::OK),
        fail = mark(markers::FAIL),
        exit = if exit_on_failure { "; exit 1" } else { "" },
    )
}

fn input_payload<'a>(args: impl Iterator<Item = &'a TaskArgs>) -> Result<Vec<u8>> {
    let (all_args, all_kwargs): (Vec<_>, Vec<_>) =
        args.map(|a| (&a.args, &a.kwargs)).unzip();
    Ok(serde_json::to_vec(&(all_args, all_kwargs))?)
}

impl EngineInner {
    pub(crate) async fn submit(self: &Arc<Self>, job: Arc<LogicalJob>, args: TaskArgs) -> Result<()> {
        if self.is_stopped() {
            return Err(SubmissionConfigError::EngineStopped(job.id.to_string()).into());
        }

        if self.client.supports_reunion() && !self.config.debug {
            self.scanned
                .get_or_try_init(|| async {
                    self.reunion
                        .scan(self.client.as_ref(), self.scratch.as_ref())
                        .await
                        .map(|_| ())
                })
                .await?;
        }

        self.ensure_code_package().await?;

        let options = self.resolve(&job);
        if options.cache {
            if let Some(remote_id) = self.reunion.lookup_and_claim(&job.eval_hash) {
                if self.reunite(&job, &remote_id).await? {
                    self.ensure_monitor();
                    return Ok(());
                }
            }
        }

        self.batcher.add_job(PendingSubmission { job, args });
        self.ensure_monitor();
        Ok(())
    }

    /// Registers `job` under an existing remote job if the cluster still
    /// knows it.
    async fn reunite(&self, job: &Arc<LogicalJob>, remote_id: &RemoteJobId) -> Result<bool> {
        let records = self.client.describe(std::slice::from_ref(remote_id)).await?;
        if !records.iter().any(|r| &r.id == remote_id) {
            tracing::debug!(
                "Remote job {} for hash {} is gone; submitting '{}' anew",
                remote_id,
                job.eval_hash,
                job.id
            );
            return Ok(false);
        }
        self.registry.insert(remote_id.clone(), job.clone());
        let message = format!(
            "Reunited job '{}' with existing {} {}",
            job.id,
            self.kind().describe_job_type(),
            remote_id
        );
        tracing::info!("{}", message);
        self.scheduler.log(&message, Level::INFO);
        Ok(true)
    }

    pub(crate) async fn ensure_code_package(&self) -> Result<Option<&CodeRef>> {
        let code = self
            .code
            .get_or_try_init(|| async {
                let Some(spec) = self.config.code_package.spec() else {
                    return Ok(None);
                };
                self.packager
                    .package(&spec, self.scratch.as_ref())
                    .await
                    .map(Some)
                    .map_err(EngineError::from)
            })
            .await?;
        Ok(code.as_ref())
    }

    fn request(
        &self,
        name: String,
        command: Vec<String>,
        options: ResolvedOptions,
        array_size: Option<usize>,
    ) -> SubmitRequest {
        SubmitRequest {
            name,
            image: options.image.clone(),
            queue: self.config.queue.clone(),
            command,
            resources: options.resources(),
            tags: options.tags,
            array_size,
            volumes: options.volumes,
        }
    }

    async fn submit_single(&self, submission: PendingSubmission) -> Result<RemoteJobId> {
        let PendingSubmission { job, args } = submission;
        let options = self.resolve(&job);
        let code = self.ensure_code_package().await?.cloned();
        let key = |kind: &'static str| ScratchKey::job(&job.eval_hash, kind);

        let command = match &job.task.kind {
            TaskKind::Structured => {
                self.scratch
                    .write(&key(payloads::INPUT), &input_payload(std::iter::once(&args))?)
                    .await?;
                let paths = RunnerPaths {
                    input: self.scratch.location(&key(payloads::INPUT)),
                    output: self.scratch.location(&key(payloads::OUTPUT)),
                    error: self.scratch.location(&key(payloads::ERROR)),
                };
                runner_command(
                    &self.config.runner_program,
                    &job,
                    code.as_ref(),
                    &paths,
                    false,
                    options.cache,
                )
            }
            TaskKind::Script { .. } => {
                let rendered = job.task.render_command(&args)?;
                self.scratch
                    .write(&key(payloads::INPUT), rendered.as_bytes())
                    .await?;
                let exit_on_failure = !self.kind().is_local();
                vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    script_wrapper(self.scratch.as_ref(), &job, exit_on_failure),
                ]
            }
        };

        let name = job_name(&options.job_name_prefix, &job.eval_hash.0, false);
        let request = self.request(name, command, options, None);
        let handle = self.client.submit(&request).await?;
        self.registry.insert(handle.id.clone(), job.clone());
        tracing::info!(
            "Submitted {} {} ({}) for job '{}'",
            self.kind().describe_job_type(),
            handle.id,
            handle.name,
            job
        );
        Ok(handle.id)
    }

    async fn submit_array(&self, batch: Vec<PendingSubmission>) -> Result<RemoteJobId> {
        let Some(first) = batch.first() else {
            return Err(SubmissionConfigError::EmptyArray.into());
        };
        let task_name = first.job.task.fullname();
        for submission in &batch {
            if submission.job.is_script() {
                return Err(SubmissionConfigError::ScriptArray(submission.job.task.fullname()).into());
            }
            let other = submission.job.task.fullname();
            if other != task_name {
                return Err(SubmissionConfigError::MixedArray {
                    first: task_name,
                    other,
                }
                .into());
            }
        }

        let first_job = first.job.clone();
        let mut options = self.resolve(&first_job);
        options.tags.remove(tags::JOB_ID);
        let code = self.ensure_code_package().await?.cloned();

        let array_uuid = uuid::Uuid::new_v4().simple().to_string();
        let key = |kind: &'static str| ScratchKey::array(&array_uuid, kind);

        let output_locations: Vec<String> = batch
            .iter()
            .map(|s| self.scratch.location(&ScratchKey::job(&s.job.eval_hash, payloads::OUTPUT)))
            .collect();
        let error_locations: Vec<String> = batch
            .iter()
            .map(|s| self.scratch.location(&ScratchKey::job(&s.job.eval_hash, payloads::ERROR)))
            .collect();
        let eval_hashes: String = batch
            .iter()
            .map(|s| format!("{}\n", s.job.eval_hash))
            .collect();

        self.scratch
            .write(&key(payloads::INPUT), &input_payload(batch.iter().map(|s| &s.args))?)
            .await?;
        self.scratch
            .write(&key(payloads::OUTPUT), &serde_json::to_vec(&output_locations)?)
            .await?;
        self.scratch
            .write(&key(payloads::ERROR), &serde_json::to_vec(&error_locations)?)
            .await?;
        self.scratch
            .write(&key(payloads::EVAL_HASHES), eval_hashes.as_bytes())
            .await?;

        let paths = RunnerPaths {
            input: self.scratch.location(&key(payloads::INPUT)),
            output: self.scratch.location(&key(payloads::OUTPUT)),
            error: self.scratch.location(&key(payloads::ERROR)),
        };
        let command = runner_command(
            &self.config.runner_program,
            &first_job,
            code.as_ref(),
            &paths,
            true,
            options.cache,
        );
        let name = job_name(&options.job_name_prefix, &array_uuid, true);
        let request = self.request(name, command, options, Some(batch.len()));
        let handle = self.client.submit(&request).await?;

        for (index, submission) in batch.iter().enumerate() {
            self.registry.insert(handle.member(index), submission.job.clone());
        }
        tracing::info!(
            "Submitted array {} ({}) of {} jobs for task '{}'",
            handle.id,
            handle.name,
            batch.len(),
            task_name
        );
        Ok(handle.id)
    }
}

#[async_trait]
impl SubmissionSink for EngineInner {
    async fn build_array(&self, batch: Vec<PendingSubmission>) -> Result<RemoteJobId> {
        self.submit_array(batch).await
    }

    async fn build_single(&self, submission: PendingSubmission) -> Result<RemoteJobId> {
        self.submit_single(submission).await
    }

    async fn submission_failed(&self, jobs: Vec<Arc<LogicalJob>>, error: EngineError) {
        if error.is_config_error() {
            tracing::error!("Fatal submission error: {}", error);
            self.scheduler.reject_executor(error);
            self.stop();
            return;
        }
        let job_error = JobError::RemoteFailure {
            reason: format!("Submission failed: {}", error),
        };
        for job in jobs {
            tracing::warn!("Submission of job '{}' failed: {}", job.id, error);
            self.scheduler.reject_job(
                &job,
                job_error.clone(),
                Traceback::from_error(&job_error),
                &Vec::new(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_core::model::TaskDef;
    use remex_executor::FsScratch;

    #[test]
    fn test_runner_command_layout() {
        let job = LogicalJob::new(
            "1",
            "abc",
            Arc::new(TaskDef::structured(Some("bio"), "align", "bio.tasks")),
        );
        let code = CodeRef {
            location: "/s/code/d.tar".into(),
            digest: "d".into(),
        };
        let paths = RunnerPaths {
            input: "/s/in".into(),
            output: "/s/out".into(),
            error: "/s/err".into(),
        };
        assert_eq!(
            runner_command("remex", &job, Some(&code), &paths, true, false),
            vec![
                "remex", "oneshot", "bio.tasks", "--code", "/s/code/d.tar", "--array-job",
                "--no-cache", "--input", "/s/in", "--output", "/s/out", "--error", "/s/err",
                "bio.align",
            ]
        );
    }

    #[test]
    fn test_script_wrapper_exit_only_on_cluster() {
        let scratch = FsScratch::new("/scratch");
        let job = LogicalJob::new("1", "h1", Arc::new(TaskDef::script(None, "s", "echo hi")));

        let cluster = script_wrapper(&scratch, &job, true);
        assert!(cluster.starts_with("set -o pipefail;"));
        assert!(cluster.contains("cp '/scratch/jobs/h1/input' '.task_command'"));
        assert!(cluster.contains("echo 'ok' > '.task_status'"));
        assert!(cluster.contains("'/scratch/jobs/h1/status'"));
        assert!(cluster.ends_with("; exit 1)"));

        let local = script_wrapper(&scratch, &job, false);
        assert!(!local.contains("exit 1"));
    }

    #[test]
    fn test_input_payload_shape() {
        let mut kwargs = std::collections::BTreeMap::new();
        kwargs.insert("k".to_string(), serde_json::json!(true));
        let a = TaskArgs::positional(vec![serde_json::json!(1)]);
        let b = TaskArgs::new(vec![], kwargs);
        let payload = input_payload([a, b].iter()).unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"[[[1],[]],[{},{"k":true}]]"#
        );
    }
}
