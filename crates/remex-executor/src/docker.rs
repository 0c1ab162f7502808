use crate::backend::{ClusterClient, SubmitHandle, SubmitRequest, StatusRecord};
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use remex_core::constants::env as env_vars;
use remex_core::logging::log_command;
use remex_core::model::{BackendKind, RemoteJobId};
use serde::Deserialize;
use tokio::process::Command as TokioCommand;

const JOB_NAME_LABEL: &str = "remex.job-name";

/// Runs jobs as detached containers through a docker-compatible CLI.
///
/// Array submissions start one container per member, each with
/// `REMEX_ARRAY_INDEX` set. Finished containers are removed as soon as
/// their status has been observed, after capturing their logs.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    binary: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    status: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    error: String,
}

impl DockerBackend {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    pub(crate) fn run_args(&self, request: &SubmitRequest, array_index: Option<usize>) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--label".to_string(),
            format!("{}={}", JOB_NAME_LABEL, request.name),
        ];
        for (key, value) in &request.tags {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(index) = array_index {
            args.push("-e".to_string());
            args.push(format!("{}={}", env_vars::ARRAY_INDEX, index));
        }

        let res = &request.resources;
        args.push(format!("--cpus={}", res.vcpus));
        args.push(format!("--memory={}g", res.memory_gib));
        if res.gpus > 0 {
            args.push(format!("--gpus={}", res.gpus));
        }
        for (host, container) in &request.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host, container));
        }

        args.push(request.image.clone());
        args.extend(request.command.iter().cloned());
        args
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = TokioCommand::new(&self.binary);
        cmd.args(args);
        log_command(cmd.as_std());
        cmd.output().await.map_err(|e| BackendError::CommandFailed {
            command: format!("{} {}", self.binary, args.join(" ")),
            source: e,
        })
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(BackendError::CommandExited {
                command: format!("{} {}", self.binary, args.join(" ")),
                code: output.status.code().unwrap_or(1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn start_container(&self, request: &SubmitRequest, index: Option<usize>) -> Result<RemoteJobId> {
        let args = self.run_args(request, index);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run_checked(&arg_refs).await?;
        let id = stdout.trim();
        if id.is_empty() {
            return Err(BackendError::Protocol {
                backend: self.binary.clone(),
                reason: "`run -d` printed no container id".to_string(),
            });
        }
        Ok(RemoteJobId::from(id))
    }

    /// Stops and removes containers of a partially started array.
    async fn discard(&self, ids: &[RemoteJobId]) {
        for id in ids {
            tracing::warn!("Removing container {} of failed array submission", id);
            if let Err(e) = self.run_checked(&["rm", "-f", id.as_str()]).await {
                tracing::warn!("Failed to remove container {}: {}", id, e);
            }
        }
    }

    async fn inspect(&self, id: &RemoteJobId) -> Result<Option<(String, ContainerState)>> {
        let output = self
            .run(&[
                "inspect",
                "--format",
                "{{index .Config.Labels \"remex.job-name\"}}\t{{json .State}}",
                id.as_str(),
            ])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some((name, state)) = stdout.trim().split_once('\t') else {
            return Err(BackendError::Protocol {
                backend: self.binary.clone(),
                reason: format!("unexpected inspect output: {}", stdout.trim()),
            });
        };
        let state: ContainerState =
            serde_json::from_str(state).map_err(|e| BackendError::Protocol {
                backend: self.binary.clone(),
                reason: format!("invalid container state: {}", e),
            })?;
        Ok(Some((name.to_string(), state)))
    }

    async fn combined_logs(&self, id: &RemoteJobId, tail: Option<usize>) -> Result<String> {
        let tail_arg = tail.map(|n| n.to_string());
        let mut args = vec!["logs"];
        if let Some(n) = tail_arg.as_deref() {
            args.push("--tail");
            args.push(n);
        }
        args.push(id.as_str());
        let output = self.run(&args).await?;
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn describe_one(&self, id: &RemoteJobId) -> Result<StatusRecord> {
        let mut record = StatusRecord {
            id: id.clone(),
            ..Default::default()
        };
        let Some((name, state)) = self.inspect(id).await? else {
            record.failed = 1;
            record.status_reason = Some(format!("Container {} no longer exists", id));
            return Ok(record);
        };
        record.name = name;

        match state.status.as_str() {
            "created" => {}
            "running" | "paused" | "restarting" => {
                record.active = 1;
                record.started = true;
            }
            _ => {
                record.started = true;
                record.logs = Some(self.combined_logs(id, None).await?);
                if let Err(e) = self.run_checked(&["rm", id.as_str()]).await {
                    tracing::warn!("Failed to remove container {}: {}", id, e);
                }
                if state.exit_code == 0 {
                    record.succeeded = 1;
                } else {
                    record.failed = 1;
                    record.status_reason = Some(format!(
                        "Container exited with code {}",
                        state.exit_code
                    ));
                    if !state.error.is_empty() {
                        record.container_reason = Some(state.error);
                    }
                }
            }
        }
        Ok(record)
    }
}

#[async_trait]
impl ClusterClient for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalContainer
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitHandle> {
        match request.array_size {
            None => {
                let id = self.start_container(request, None).await?;
                tracing::debug!("Started container {} for '{}'", id, request.name);
                Ok(SubmitHandle {
                    id,
                    name: request.name.clone(),
                    members: Vec::new(),
                })
            }
            Some(size) => {
                let mut members = Vec::with_capacity(size);
                for index in 0..size {
                    match self.start_container(request, Some(index)).await {
                        Ok(id) => members.push(id),
                        Err(e) => {
                            self.discard(&members).await;
                            return Err(e);
                        }
                    }
                }
                tracing::debug!("Started {} containers for '{}'", size, request.name);
                Ok(SubmitHandle {
                    id: RemoteJobId::from(request.name.as_str()),
                    name: request.name.clone(),
                    members,
                })
            }
        }
    }

    /// Ids of containers that vanished are reported as failed so that they
    /// leave the pending set.
    async fn describe(&self, ids: &[RemoteJobId]) -> Result<Vec<StatusRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            records.push(self.describe_one(id).await?);
        }
        Ok(records)
    }

    async fn list_all(&self, prefix: &str) -> Result<Vec<StatusRecord>> {
        let format = format!("{{{{.ID}}}}\t{{{{.Label \"{}\"}}}}", JOB_NAME_LABEL);
        let filter = format!("label={}", JOB_NAME_LABEL);
        let stdout = self
            .run_checked(&["ps", "--no-trunc", "--filter", &filter, "--format", &format])
            .await?;
        Ok(stdout
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .filter(|(_, name)| name.starts_with(prefix))
            .map(|(id, name)| StatusRecord {
                id: RemoteJobId::from(id),
                name: name.to_string(),
                active: 1,
                started: true,
                ..Default::default()
            })
            .collect())
    }

    async fn kill(&self, id: &RemoteJobId, reason: &str) -> Result<()> {
        tracing::info!("Killing container {}: {}", id, reason);
        self.run_checked(&["kill", id.as_str()]).await?;
        Ok(())
    }

    async fn log_tail(&self, id: &RemoteJobId, max_lines: usize) -> Result<Vec<String>> {
        let logs = self.combined_logs(id, Some(max_lines)).await?;
        Ok(logs.lines().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResourceRequest;
    use std::collections::BTreeMap;

    fn request() -> SubmitRequest {
        let mut tags = BTreeMap::new();
        tags.insert("remex_job_id".to_string(), "job-1".to_string());
        SubmitRequest {
            name: "remex-job-abc".into(),
            image: "worker:1".into(),
            queue: None,
            command: vec!["bash".into(), "-c".into(), "echo hi".into()],
            resources: ResourceRequest {
                vcpus: 2,
                memory_gib: 4,
                gpus: 0,
                retries: 1,
                role: None,
                timeout_secs: None,
            },
            tags,
            array_size: None,
            volumes: vec![("/tmp/scratch".into(), "/tmp/scratch".into())],
        }
    }

    #[test]
    fn test_run_args_single() {
        let backend = DockerBackend::new("docker");
        assert_eq!(
            backend.run_args(&request(), None),
            vec![
                "run",
                "-d",
                "--label",
                "remex.job-name=remex-job-abc",
                "--label",
                "remex_job_id=job-1",
                "--cpus=2",
                "--memory=4g",
                "-v",
                "/tmp/scratch:/tmp/scratch",
                "worker:1",
                "bash",
                "-c",
                "echo hi",
            ]
        );
    }

    #[test]
    fn test_run_args_array_member_and_gpus() {
        let backend = DockerBackend::new("podman");
        let mut req = request();
        req.resources.gpus = 1;
        let args = backend.run_args(&req, Some(3));
        assert!(args.contains(&"REMEX_ARRAY_INDEX=3".to_string()));
        assert!(args.contains(&"--gpus=1".to_string()));
    }

    /// A container CLI stand-in that records its arguments and refuses to
    /// start array member 2.
    #[cfg(unix)]
    fn fake_binary(dir: &std::path::Path) -> (String, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;
        let calls = dir.join("calls.log");
        let script = format!(
            r#"#!/bin/sh
echo "$*" >> '{calls}'
case "$*" in
  *REMEX_ARRAY_INDEX=2*) echo "no space left" >&2; exit 125 ;;
  run*) echo "$*" | sed 's/.*REMEX_ARRAY_INDEX=\([0-9]*\).*/c\1/' ;;
esac
"#,
            calls = calls.display()
        );
        let path = dir.join("fake-docker");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (path.to_string_lossy().into_owned(), calls)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_array_submission_removes_started_members() {
        let dir = tempfile::tempdir().unwrap();
        let (binary, calls) = fake_binary(dir.path());
        let backend = DockerBackend::new(&binary);
        let mut req = request();
        req.array_size = Some(3);

        let err = backend.submit(&req).await.unwrap_err();
        assert!(matches!(err, BackendError::CommandExited { code: 125, .. }));

        let log = std::fs::read_to_string(calls).unwrap();
        let removed: Vec<&str> = log.lines().filter(|l| l.starts_with("rm ")).collect();
        assert_eq!(removed, vec!["rm -f c0", "rm -f c1"]);
    }

    #[test]
    fn test_container_state_parsing() {
        let state: ContainerState =
            serde_json::from_str(r#"{"Status":"exited","Running":false,"ExitCode":1,"Error":""}"#)
                .unwrap();
        assert_eq!(state.status, "exited");
        assert_eq!(state.exit_code, 1);
    }
}
