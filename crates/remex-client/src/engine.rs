use crate::batching::{ArrayerConfig, Batcher, BatcherFactory, JobArrayer, SubmissionSink};
use crate::error::{EngineError, Result};
use crate::monitor;
use crate::options::{resolve_options, Identity, ResolvedOptions};
use crate::registry::PendingRegistry;
use crate::reunion::ReunionCache;
use crate::scheduler::Scheduler;
use remex_core::config::EngineConfig;
use remex_core::errors::ConfigError;
use remex_core::model::{BackendKind, LogicalJob, RemoteJobId, TaskArgs, TaskOptions};
use remex_executor::{
    ClusterClient, CodePackager, CodeRef, DockerBackend, FsScratch, Scratch, TarPackager,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) scratch: Arc<dyn Scratch>,
    pub(crate) packager: Arc<dyn CodePackager>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) batcher: Arc<dyn Batcher>,
    pub(crate) registry: PendingRegistry,
    pub(crate) reunion: ReunionCache,
    pub(crate) identity: Identity,
    pub(crate) defaults: TaskOptions,
    lifecycle: Mutex<Lifecycle>,
    monitoring: watch::Sender<bool>,
    pub(crate) cancel: CancellationToken,
    pub(crate) scanned: OnceCell<()>,
    pub(crate) code: OnceCell<Option<CodeRef>>,
}

impl EngineInner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn kind(&self) -> BackendKind {
        self.client.kind()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.lifecycle() == Lifecycle::Stopped
    }

    pub(crate) fn resolve(&self, job: &LogicalJob) -> ResolvedOptions {
        resolve_options(&self.defaults, job, self.config.default_tags, &self.identity)
    }

    /// Starts the monitor unless it is already running or the engine has
    /// stopped.
    pub(crate) fn ensure_monitor(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle();
        if *lifecycle != Lifecycle::Idle {
            return;
        }
        *lifecycle = Lifecycle::Running;
        self.monitoring.send_replace(true);
        tracing::debug!("Starting job monitor");
        tokio::spawn(monitor::run(self.clone()));
    }

    /// Moves the engine to idle when nothing is pending or buffered. The
    /// check runs under the lifecycle lock, which `ensure_monitor` also
    /// takes after a job was handed over, so no submission is stranded.
    pub(crate) fn try_go_idle(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if *lifecycle != Lifecycle::Running {
            return true;
        }
        if !self.registry.is_empty() || self.batcher.num_pending() > 0 {
            return false;
        }
        *lifecycle = Lifecycle::Idle;
        self.monitoring.send_replace(false);
        tracing::debug!("No pending jobs; job monitor going idle");
        true
    }

    pub(crate) fn stop(&self) {
        self.batcher.stop();
        self.cancel.cancel();
        let mut lifecycle = self.lifecycle();
        if *lifecycle != Lifecycle::Stopped {
            tracing::info!(
                "Stopping engine with {} jobs still pending",
                self.registry.len()
            );
        }
        *lifecycle = Lifecycle::Stopped;
        self.monitoring.send_replace(false);
    }
}

/// Remote-execution engine: dispatches logical jobs to a cluster backend
/// and reports their outcomes to the scheduler.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig, scheduler: Arc<dyn Scheduler>) -> EngineBuilder {
        EngineBuilder {
            config,
            scheduler,
            client: None,
            scratch: None,
            packager: None,
            batcher: None,
            identity: None,
        }
    }

    /// Submits a job. The job is either reunited with an inflight remote job
    /// of the same eval hash or handed to the batcher.
    pub async fn submit(&self, job: Arc<LogicalJob>, args: TaskArgs) -> Result<()> {
        self.inner.submit(job, args).await
    }

    /// Stops the batcher and the monitor. Jobs still pending are not
    /// reported.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    pub fn is_monitoring(&self) -> bool {
        *self.inner.monitoring.borrow()
    }

    /// Resolves once the monitor has gone idle or the engine stopped.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.monitoring.subscribe();
        let _ = rx.wait_for(|monitoring| !*monitoring).await;
    }

    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn pending_ids(&self) -> Vec<RemoteJobId> {
        self.inner.registry.ids_in_order()
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    pub async fn kill_jobs(&self, ids: &[RemoteJobId], reason: &str) -> Result<()> {
        for id in ids {
            self.inner.client.kill(id, reason).await?;
        }
        Ok(())
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    scheduler: Arc<dyn Scheduler>,
    client: Option<Arc<dyn ClusterClient>>,
    scratch: Option<Arc<dyn Scratch>>,
    packager: Option<Arc<dyn CodePackager>>,
    batcher: Option<BatcherFactory>,
    identity: Option<Identity>,
}

impl EngineBuilder {
    pub fn cluster(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn scratch(mut self, scratch: Arc<dyn Scratch>) -> Self {
        self.scratch = Some(scratch);
        self
    }

    pub fn packager(mut self, packager: Arc<dyn CodePackager>) -> Self {
        self.packager = Some(packager);
        self
    }

    pub fn batcher(mut self, factory: BatcherFactory) -> Self {
        self.batcher = Some(factory);
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Without an explicit cluster client, debug mode runs jobs in local
    /// containers. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let config = self.config;

        let client: Arc<dyn ClusterClient> = match self.client {
            Some(client) => client,
            None if config.debug => Arc::new(DockerBackend::new(&config.container_binary)),
            None => {
                return Err(EngineError::Config(ConfigError::General(
                    "no cluster client configured; set `debug = true` to run jobs in local containers"
                        .to_string(),
                )))
            }
        };
        let scratch: Arc<dyn Scratch> = self
            .scratch
            .unwrap_or_else(|| Arc::new(FsScratch::new(&config.scratch)));
        let packager: Arc<dyn CodePackager> =
            self.packager.unwrap_or_else(|| Arc::new(TarPackager::new()));
        let factory = self
            .batcher
            .unwrap_or_else(|| JobArrayer::factory(ArrayerConfig::from_engine_config(&config)));
        let identity = self.identity.unwrap_or_else(Identity::current);

        let mut defaults = config.default_task_options();
        if client.kind().is_local() {
            defaults
                .volumes
                .push((config.scratch.clone(), config.scratch.clone()));
        }

        tracing::info!(
            "Building engine on {} backend (image '{}', scratch '{}')",
            client.kind(),
            config.image,
            config.scratch
        );

        let scheduler = self.scheduler;
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let sink: Weak<dyn SubmissionSink> = weak.clone();
            let (monitoring, _) = watch::channel(false);
            EngineInner {
                config,
                client,
                scratch,
                packager,
                scheduler,
                batcher: factory(sink),
                registry: PendingRegistry::new(),
                reunion: ReunionCache::new(),
                identity,
                defaults,
                lifecycle: Mutex::new(Lifecycle::Idle),
                monitoring,
                cancel: CancellationToken::new(),
                scanned: OnceCell::new(),
                code: OnceCell::new(),
            }
        });
        Ok(Engine { inner })
    }
}
