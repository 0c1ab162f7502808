use remex_core::config::{CodePackage, EngineConfig};
use remex_core::model::{LogicalJob, TaskDef, TaskOptions};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Temporary scratch root plus an engine configuration tuned for fast tests.
pub struct TestContext {
    pub _temp_dir: tempfile::TempDir,
    pub test_root: PathBuf,
    pub scratch_dir: PathBuf,
    pub config: EngineConfig,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = tempfile::Builder::new()
            .prefix("remex-test-")
            .tempdir()
            .expect("Failed to create temp dir");
        let test_root = temp_dir.path().to_path_buf();
        let scratch_dir = test_root.join("scratch");
        fs::create_dir_all(&scratch_dir).expect("Failed to create scratch dir");

        let config_content = format!(
            r#"
image = "registry.example.com/remex-worker:test"
scratch = "{}"
job_monitor_interval = 0.02
job_stale_time = 0.05
min_array_size = 3
code_package = false
"#,
            scratch_dir.display()
        );
        let config =
            EngineConfig::from_toml_str(&config_content).expect("Failed to parse test config");

        Self {
            _temp_dir: temp_dir,
            test_root,
            scratch_dir,
            config,
        }
    }

    pub fn debug(mut self) -> Self {
        self.config.debug = true;
        self
    }

    pub fn with_code_package(mut self, package: CodePackage) -> Self {
        self.config.code_package = package;
        self
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

pub fn structured_task(name: &str) -> Arc<TaskDef> {
    Arc::new(TaskDef::structured(Some("tests"), name, "tests.tasks"))
}

pub fn script_task(name: &str, template: &str) -> Arc<TaskDef> {
    Arc::new(TaskDef::script(Some("tests"), name, template))
}

/// A job whose eval hash is derived from `id`, so names stay readable in
/// assertions.
pub fn job(id: &str, task: &Arc<TaskDef>) -> Arc<LogicalJob> {
    Arc::new(
        LogicalJob::new(id, &format!("h{}", id), task.clone()).with_execution("exec-1", Some("tests")),
    )
}

pub fn job_with_options(id: &str, task: &Arc<TaskDef>, options: TaskOptions) -> Arc<LogicalJob> {
    Arc::new(
        LogicalJob::new(id, &format!("h{}", id), task.clone())
            .with_execution("exec-1", Some("tests"))
            .with_options(options),
    )
}
