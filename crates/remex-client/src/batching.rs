use crate::error::{EngineError, Result};
use async_trait::async_trait;
use remex_core::config::EngineConfig;
use remex_core::model::{LogicalJob, RemoteJobId, TaskArgs};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PendingSubmission {
    pub job: Arc<LogicalJob>,
    pub args: TaskArgs,
}

/// Builders a batcher calls when it flushes.
#[async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn build_array(&self, batch: Vec<PendingSubmission>) -> Result<RemoteJobId>;

    async fn build_single(&self, submission: PendingSubmission) -> Result<RemoteJobId>;

    /// Reports a builder error for the jobs it affected.
    async fn submission_failed(&self, jobs: Vec<Arc<LogicalJob>>, error: EngineError);
}

/// Groups submissions before they reach the builders.
pub trait Batcher: Send + Sync {
    fn add_job(&self, submission: PendingSubmission);

    /// Jobs accepted but not yet registered as pending remote jobs.
    fn num_pending(&self) -> usize;

    fn stop(&self);
}

pub type BatcherFactory = Box<dyn FnOnce(Weak<dyn SubmissionSink>) -> Arc<dyn Batcher> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayerConfig {
    pub min_array_size: usize,
    pub max_array_size: usize,
    /// A group is flushed once no job was added to it for this long.
    pub stale_time: Duration,
    pub poll_interval: Duration,
}

impl ArrayerConfig {
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            min_array_size: config.min_array_size,
            max_array_size: config.max_array_size,
            stale_time: config.stale_time(),
            poll_interval: config.stale_time().clamp(Duration::from_millis(10), Duration::from_secs(1)),
        }
    }
}

struct Group {
    items: Vec<PendingSubmission>,
    last_add: Instant,
}

#[derive(Default)]
struct State {
    groups: HashMap<String, Group>,
    pending: usize,
    stopped: bool,
}

/// Collects jobs of the same task arriving close in time and submits them
/// as one array job when there are enough of them.
pub struct JobArrayer {
    config: ArrayerConfig,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobArrayer {
    /// Starts the flush task. Must be called from within a tokio runtime.
    pub fn spawn(sink: Weak<dyn SubmissionSink>, config: ArrayerConfig) -> Arc<Self> {
        let arrayer = Arc::new(Self {
            config,
            state: Arc::new(Mutex::new(State::default())),
            cancel: CancellationToken::new(),
        });
        let worker = arrayer.clone();
        tokio::spawn(async move { worker.run(sink).await });
        arrayer
    }

    pub fn factory(config: ArrayerConfig) -> BatcherFactory {
        Box::new(move |sink| JobArrayer::spawn(sink, config) as Arc<dyn Batcher>)
    }

    async fn run(&self, sink: Weak<dyn SubmissionSink>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            let ready = self.take_ready();
            if ready.is_empty() {
                continue;
            }
            let Some(sink) = sink.upgrade() else {
                tracing::debug!("Submission sink dropped; stopping job arrayer");
                break;
            };
            for batch in ready {
                let count = batch.len();
                self.submit_batch(sink.as_ref(), batch).await;
                let mut state = lock(&self.state);
                state.pending = state.pending.saturating_sub(count);
            }
        }
        let dropped = lock(&self.state).pending;
        if dropped > 0 {
            tracing::warn!("Job arrayer stopped with {} unsubmitted jobs", dropped);
        }
    }

    /// Removes the groups due for submission. `pending` is left untouched
    /// until the builders have registered the jobs.
    fn take_ready(&self) -> Vec<Vec<PendingSubmission>> {
        let mut state = lock(&self.state);
        if state.stopped {
            return Vec::new();
        }
        let now = Instant::now();
        let due: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, g)| {
                g.items.len() >= self.config.max_array_size
                    || now.duration_since(g.last_add) >= self.config.stale_time
            })
            .map(|(name, _)| name.clone())
            .collect();
        due.into_iter()
            .filter_map(|name| state.groups.remove(&name))
            .map(|g| g.items)
            .collect()
    }

    async fn submit_batch(&self, sink: &dyn SubmissionSink, batch: Vec<PendingSubmission>) {
        let arrayable = batch.len() >= self.config.min_array_size
            && !batch.iter().any(|s| s.job.is_script());

        if !arrayable {
            for submission in batch {
                let job = submission.job.clone();
                if let Err(e) = sink.build_single(submission).await {
                    sink.submission_failed(vec![job], e).await;
                }
            }
            return;
        }

        let mut rest = batch;
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(self.config.max_array_size));
            let chunk = std::mem::replace(&mut rest, tail);
            if chunk.len() < self.config.min_array_size {
                for submission in chunk {
                    let job = submission.job.clone();
                    if let Err(e) = sink.build_single(submission).await {
                        sink.submission_failed(vec![job], e).await;
                    }
                }
                continue;
            }
            let jobs: Vec<Arc<LogicalJob>> = chunk.iter().map(|s| s.job.clone()).collect();
            if let Err(e) = sink.build_array(chunk).await {
                sink.submission_failed(jobs, e).await;
            }
        }
    }
}

impl Batcher for JobArrayer {
    fn add_job(&self, submission: PendingSubmission) {
        let mut state = lock(&self.state);
        if state.stopped {
            tracing::warn!(
                "Job arrayer is stopped; dropping job '{}'",
                submission.job.id
            );
            return;
        }
        state.pending += 1;
        let key = submission.job.task.fullname();
        let group = state.groups.entry(key).or_insert_with(|| Group {
            items: Vec::new(),
            last_add: Instant::now(),
        });
        group.items.push(submission);
        group.last_add = Instant::now();
    }

    fn num_pending(&self) -> usize {
        lock(&self.state).pending
    }

    fn stop(&self) {
        lock(&self.state).stopped = true;
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_core::model::TaskDef;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingSink {
        arrays: AsyncMutex<Vec<Vec<String>>>,
        singles: AsyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl SubmissionSink for RecordingSink {
        async fn build_array(&self, batch: Vec<PendingSubmission>) -> Result<RemoteJobId> {
            self.arrays
                .lock()
                .await
                .push(batch.iter().map(|s| s.job.id.0.clone()).collect());
            Ok(RemoteJobId::from("array"))
        }

        async fn build_single(&self, submission: PendingSubmission) -> Result<RemoteJobId> {
            self.singles.lock().await.push(submission.job.id.0.clone());
            Ok(RemoteJobId::from("single"))
        }

        async fn submission_failed(&self, _jobs: Vec<Arc<LogicalJob>>, _error: EngineError) {}
    }

    fn submission(id: &str, task: &Arc<TaskDef>) -> PendingSubmission {
        PendingSubmission {
            job: Arc::new(LogicalJob::new(id, id, task.clone())),
            args: TaskArgs::default(),
        }
    }

    fn config() -> ArrayerConfig {
        ArrayerConfig {
            min_array_size: 3,
            max_array_size: 4,
            stale_time: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
        }
    }

    async fn wait_drained(arrayer: &JobArrayer) {
        for _ in 0..200 {
            if arrayer.num_pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("arrayer did not drain");
    }

    #[tokio::test]
    async fn test_small_group_submitted_as_singles() {
        let sink: Arc<RecordingSink> = Arc::new(RecordingSink::default());
        let weak: Weak<dyn SubmissionSink> = Arc::downgrade(&sink) as Weak<dyn SubmissionSink>;
        let arrayer = JobArrayer::spawn(weak, config());
        let task = Arc::new(TaskDef::structured(None, "f", "m"));

        arrayer.add_job(submission("1", &task));
        arrayer.add_job(submission("2", &task));
        assert_eq!(arrayer.num_pending(), 2);
        wait_drained(&arrayer).await;

        assert_eq!(sink.singles.lock().await.len(), 2);
        assert!(sink.arrays.lock().await.is_empty());
        arrayer.stop();
    }

    #[tokio::test]
    async fn test_large_group_chunked_into_arrays() {
        let sink: Arc<RecordingSink> = Arc::new(RecordingSink::default());
        let weak: Weak<dyn SubmissionSink> = Arc::downgrade(&sink) as Weak<dyn SubmissionSink>;
        let arrayer = JobArrayer::spawn(weak, config());
        let task = Arc::new(TaskDef::structured(None, "f", "m"));

        for i in 0..9 {
            arrayer.add_job(submission(&i.to_string(), &task));
        }
        wait_drained(&arrayer).await;

        let arrays = sink.arrays.lock().await.clone();
        let singles = sink.singles.lock().await.clone();
        assert_eq!(arrays.iter().map(Vec::len).sum::<usize>() + singles.len(), 9);
        assert!(arrays.iter().all(|a| a.len() >= 3 && a.len() <= 4));
        arrayer.stop();
    }

    #[tokio::test]
    async fn test_script_tasks_never_arrayed() {
        let sink: Arc<RecordingSink> = Arc::new(RecordingSink::default());
        let weak: Weak<dyn SubmissionSink> = Arc::downgrade(&sink) as Weak<dyn SubmissionSink>;
        let arrayer = JobArrayer::spawn(weak, config());
        let task = Arc::new(TaskDef::script(None, "s", "echo {0}"));

        for i in 0..3 {
            arrayer.add_job(submission(&i.to_string(), &task));
        }
        wait_drained(&arrayer).await;

        assert!(sink.arrays.lock().await.is_empty());
        assert_eq!(sink.singles.lock().await.len(), 3);
        arrayer.stop();
    }

    #[tokio::test]
    async fn test_stopped_arrayer_drops_jobs() {
        let sink: Arc<RecordingSink> = Arc::new(RecordingSink::default());
        let weak: Weak<dyn SubmissionSink> = Arc::downgrade(&sink) as Weak<dyn SubmissionSink>;
        let arrayer = JobArrayer::spawn(weak, config());
        arrayer.stop();
        let task = Arc::new(TaskDef::structured(None, "f", "m"));
        arrayer.add_job(submission("1", &task));
        assert_eq!(arrayer.num_pending(), 0);
    }
}
