use crate::error::Result;
use async_trait::async_trait;
use remex_core::model::{BackendKind, RemoteJobId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub vcpus: u32,
    pub memory_gib: u32,
    pub gpus: u32,
    pub retries: u32,
    pub role: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub name: String,
    pub image: String,
    pub queue: Option<String>,
    /// argv of the container entrypoint.
    pub command: Vec<String>,
    pub resources: ResourceRequest,
    pub tags: BTreeMap<String, String>,
    /// `Some(n)` submits an array of `n` members.
    pub array_size: Option<usize>,
    pub volumes: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitHandle {
    pub id: RemoteJobId,
    pub name: String,
    /// Per-member ids of an array submission, in index order. Empty for
    /// single jobs.
    pub members: Vec<RemoteJobId>,
}

impl SubmitHandle {
    /// Id of member `index`, falling back to the `{array_id}:{index}`
    /// addressing when the backend did not report member ids.
    pub fn member(&self, index: usize) -> RemoteJobId {
        self.members
            .get(index)
            .cloned()
            .unwrap_or_else(|| RemoteJobId::array_member(self.id.as_str(), index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RemoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteState::Succeeded | RemoteState::Failed)
    }
}

/// One observation of a remote job. Counts follow array semantics; a single
/// job has at most one of them set to 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: RemoteJobId,
    pub name: String,
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub started: bool,
    pub container_reason: Option<String>,
    pub status_reason: Option<String>,
    pub log_stream: Option<String>,
    /// Logs captured together with the status (local runtime only).
    pub logs: Option<String>,
}

impl StatusRecord {
    pub fn state(&self) -> RemoteState {
        if self.succeeded > 0 {
            RemoteState::Succeeded
        } else if self.failed > 0 {
            RemoteState::Failed
        } else if self.started || self.active > 0 {
            RemoteState::Running
        } else {
            RemoteState::Pending
        }
    }
}

/// Control-plane primitives of a compute backend.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether previously submitted jobs outlive the engine and can be
    /// reunited with.
    fn supports_reunion(&self) -> bool {
        self.kind() == BackendKind::Cluster
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitHandle>;

    /// Unknown ids are omitted from the result.
    async fn describe(&self, ids: &[RemoteJobId]) -> Result<Vec<StatusRecord>>;

    /// Non-terminal jobs whose name starts with `prefix`.
    async fn list_all(&self, prefix: &str) -> Result<Vec<StatusRecord>>;

    /// Inflight children of an array job as `(member id, index)`.
    async fn array_members(&self, _array: &StatusRecord) -> Result<Vec<(RemoteJobId, usize)>> {
        Ok(Vec::new())
    }

    async fn kill(&self, id: &RemoteJobId, reason: &str) -> Result<()>;

    async fn log_tail(&self, id: &RemoteJobId, max_lines: usize) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StatusRecord {
        StatusRecord {
            id: RemoteJobId::from("j-1"),
            name: "remex-job-abc".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_precedence() {
        let mut rec = record();
        assert_eq!(rec.state(), RemoteState::Pending);
        rec.active = 1;
        assert_eq!(rec.state(), RemoteState::Running);
        rec.failed = 1;
        assert_eq!(rec.state(), RemoteState::Failed);
        rec.succeeded = 1;
        assert_eq!(rec.state(), RemoteState::Succeeded);
        assert!(rec.state().is_terminal());
    }

    #[test]
    fn test_handle_member_fallback() {
        let handle = SubmitHandle {
            id: RemoteJobId::from("arr"),
            name: "x-array".into(),
            members: vec![],
        };
        assert_eq!(handle.member(2), RemoteJobId::from("arr:2"));

        let handle = SubmitHandle {
            members: vec![RemoteJobId::from("c0"), RemoteJobId::from("c1")],
            ..handle
        };
        assert_eq!(handle.member(1), RemoteJobId::from("c1"));
    }
}
