use async_trait::async_trait;
use remex_core::model::{BackendKind, RemoteJobId};
use remex_executor::{
    BackendError, ClusterClient, Result, StatusRecord, SubmitHandle, SubmitRequest,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Terminal state applied to every job as soon as it is submitted.
#[derive(Debug, Clone)]
pub enum Completion {
    Succeed,
    Fail {
        status_reason: Option<String>,
        container_reason: Option<String>,
    },
}

#[derive(Default)]
struct State {
    next_id: usize,
    jobs: BTreeMap<RemoteJobId, StatusRecord>,
    inflight: Vec<StatusRecord>,
    array_members: HashMap<RemoteJobId, Vec<(RemoteJobId, usize)>>,
    logs: HashMap<RemoteJobId, Vec<String>>,
    submissions: Vec<SubmitRequest>,
    submitted_ids: Vec<RemoteJobId>,
    describe_calls: Vec<Vec<RemoteJobId>>,
    killed: Vec<(RemoteJobId, String)>,
    completion: Option<Completion>,
    describe_error: Option<String>,
}

/// In-memory control plane. Jobs stay pending until a test moves them to a
/// terminal state, or a [`Completion`] is configured.
pub struct FakeCluster {
    kind: BackendKind,
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::with_kind(BackendKind::Cluster)
    }

    pub fn with_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn complete_on_submit(&self, completion: Completion) {
        self.state().completion = Some(completion);
    }

    /// Registers a job that was submitted before the engine started.
    pub fn add_inflight(&self, id: &str, name: &str) {
        let record = StatusRecord {
            id: RemoteJobId::from(id),
            name: name.to_string(),
            active: 1,
            started: true,
            ..Default::default()
        };
        let mut state = self.state();
        state.jobs.insert(record.id.clone(), record.clone());
        state.inflight.push(record);
    }

    /// Registers the inflight children of a pre-existing array job.
    pub fn add_array_members(&self, array_id: &str, indices: &[usize]) {
        let array_id = RemoteJobId::from(array_id);
        let mut state = self.state();
        let mut members = Vec::new();
        for &index in indices {
            let member = RemoteJobId::array_member(array_id.as_str(), index);
            state.jobs.insert(
                member.clone(),
                StatusRecord {
                    id: member.clone(),
                    active: 1,
                    started: true,
                    ..Default::default()
                },
            );
            members.push((member, index));
        }
        state.array_members.insert(array_id, members);
    }

    /// Drops a job from the control plane, as if it had expired.
    pub fn forget(&self, id: &RemoteJobId) {
        self.state().jobs.remove(id);
    }

    pub fn succeed(&self, id: &RemoteJobId) {
        self.update(id, |rec| {
            rec.active = 0;
            rec.started = true;
            rec.succeeded = 1;
        });
    }

    pub fn fail(&self, id: &RemoteJobId, status_reason: Option<&str>, container_reason: Option<&str>) {
        self.update(id, |rec| {
            rec.active = 0;
            rec.started = true;
            rec.failed = 1;
            rec.status_reason = status_reason.map(str::to_string);
            rec.container_reason = container_reason.map(str::to_string);
        });
    }

    pub fn start(&self, id: &RemoteJobId) {
        self.update(id, |rec| {
            rec.active = 1;
            rec.started = true;
        });
    }

    pub fn set_inline_logs(&self, id: &RemoteJobId, logs: &str) {
        self.update(id, |rec| rec.logs = Some(logs.to_string()));
    }

    pub fn set_log_lines(&self, id: &RemoteJobId, lines: &[&str]) {
        self.state()
            .logs
            .insert(id.clone(), lines.iter().map(|s| s.to_string()).collect());
    }

    pub fn fail_describes(&self, message: &str) {
        self.state().describe_error = Some(message.to_string());
    }

    fn update(&self, id: &RemoteJobId, f: impl FnOnce(&mut StatusRecord)) {
        let mut state = self.state();
        let rec = state
            .jobs
            .get_mut(id)
            .unwrap_or_else(|| panic!("unknown remote job {}", id));
        f(rec);
    }

    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.state().submissions.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.state().submissions.len()
    }

    pub fn describe_calls(&self) -> Vec<Vec<RemoteJobId>> {
        self.state().describe_calls.clone()
    }

    pub fn describe_count(&self) -> usize {
        self.state().describe_calls.len()
    }

    pub fn killed(&self) -> Vec<(RemoteJobId, String)> {
        self.state().killed.clone()
    }

    /// Ids of every job created through `submit`, array members included.
    pub fn submitted_ids(&self) -> Vec<RemoteJobId> {
        self.state().submitted_ids.clone()
    }
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(completion: &Option<Completion>, rec: &mut StatusRecord) {
    match completion {
        None => {}
        Some(Completion::Succeed) => {
            rec.started = true;
            rec.succeeded = 1;
        }
        Some(Completion::Fail {
            status_reason,
            container_reason,
        }) => {
            rec.started = true;
            rec.failed = 1;
            rec.status_reason = status_reason.clone();
            rec.container_reason = container_reason.clone();
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitHandle> {
        let mut state = self.state();
        state.next_id += 1;
        let id = RemoteJobId(format!("fake-{}", state.next_id));
        state.submissions.push(request.clone());

        let mut members = Vec::new();
        let ids = match request.array_size {
            Some(size) => {
                for index in 0..size {
                    members.push(RemoteJobId::array_member(id.as_str(), index));
                }
                members.clone()
            }
            None => vec![id.clone()],
        };
        let completion = state.completion.clone();
        for member in ids {
            let mut rec = StatusRecord {
                id: member.clone(),
                name: request.name.clone(),
                log_stream: Some(format!("stream/{}", member)),
                ..Default::default()
            };
            apply(&completion, &mut rec);
            state.submitted_ids.push(member.clone());
            state.jobs.insert(member, rec);
        }

        Ok(SubmitHandle {
            id,
            name: request.name.clone(),
            members,
        })
    }

    async fn describe(&self, ids: &[RemoteJobId]) -> Result<Vec<StatusRecord>> {
        let mut state = self.state();
        state.describe_calls.push(ids.to_vec());
        if let Some(message) = &state.describe_error {
            return Err(BackendError::Protocol {
                backend: "fake".to_string(),
                reason: message.clone(),
            });
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn list_all(&self, prefix: &str) -> Result<Vec<StatusRecord>> {
        Ok(self
            .state()
            .inflight
            .iter()
            .filter(|rec| rec.name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn array_members(&self, array: &StatusRecord) -> Result<Vec<(RemoteJobId, usize)>> {
        Ok(self
            .state()
            .array_members
            .get(&array.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn kill(&self, id: &RemoteJobId, reason: &str) -> Result<()> {
        self.state().killed.push((id.clone(), reason.to_string()));
        Ok(())
    }

    async fn log_tail(&self, id: &RemoteJobId, max_lines: usize) -> Result<Vec<String>> {
        let state = self.state();
        let lines = state.logs.get(id).cloned().unwrap_or_default();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines.into_iter().skip(skip).collect())
    }
}
