use crate::constants::naming::DEFAULT_JOB_NAME_PREFIX;
use crate::errors::ConfigError;
use crate::model::TaskOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the polling and batching intervals.
const MAX_INTERVAL_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub max_files: usize,
    pub max_age_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_age_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodePackageSpec {
    pub root: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for CodePackageSpec {
    fn default() -> Self {
        // wildmatch's `*` also matches `/`, so this selects the whole tree.
        Self {
            root: PathBuf::from("."),
            include: vec!["*".to_string()],
            exclude: Vec::new(),
        }
    }
}

/// `code_package = false` disables packaging, `true` or a table enables it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodePackage {
    Flag(bool),
    Spec(CodePackageSpec),
}

impl Default for CodePackage {
    fn default() -> Self {
        CodePackage::Flag(true)
    }
}

impl CodePackage {
    pub fn spec(&self) -> Option<CodePackageSpec> {
        match self {
            CodePackage::Flag(false) => None,
            CodePackage::Flag(true) => Some(CodePackageSpec::default()),
            CodePackage::Spec(spec) => Some(spec.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub image: String,
    pub queue: Option<String>,
    /// Root of durable scratch storage: a path or a URL understood by the
    /// configured scratch backend.
    pub scratch: String,
    pub role: Option<String>,
    /// Run jobs in local containers instead of on the cluster.
    pub debug: bool,

    pub vcpus: u32,
    pub gpus: u32,
    pub memory: u32,
    pub retries: u32,
    pub timeout: Option<u64>,
    pub job_name_prefix: String,
    pub tags: BTreeMap<String, String>,
    pub default_tags: bool,

    pub job_monitor_interval: Option<f64>,
    pub job_stale_time: f64,
    pub min_array_size: usize,
    pub max_array_size: usize,
    /// Stop polling after this many consecutive not-yet-started jobs. 0 disables.
    pub pending_truncate: usize,
    pub describe_chunk_size: usize,
    pub log_tail_lines: usize,
    pub validate_output: bool,
    pub observability_tags: bool,

    pub code_package: CodePackage,
    pub runner_program: String,
    pub container_binary: String,

    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            queue: None,
            scratch: String::new(),
            role: None,
            debug: false,
            vcpus: 1,
            gpus: 0,
            memory: 4,
            retries: 1,
            timeout: None,
            job_name_prefix: DEFAULT_JOB_NAME_PREFIX.to_string(),
            tags: BTreeMap::new(),
            default_tags: true,
            job_monitor_interval: None,
            job_stale_time: 3.0,
            min_array_size: 5,
            max_array_size: 1000,
            pending_truncate: 0,
            describe_chunk_size: 100,
            log_tail_lines: 1000,
            validate_output: false,
            observability_tags: true,
            code_package: CodePackage::default(),
            runner_program: "remex".to_string(),
            container_binary: "docker".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let expanded = shellexpand::tilde(&path.to_string_lossy()).to_string();
        let content = fs_err::read_to_string(&expanded).map_err(|e| ConfigError::PathIo {
            path: PathBuf::from(&expanded),
            source: e,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.scratch = shellexpand::tilde(&config.scratch).to_string();
        tracing::debug!("Loaded engine configuration from '{}'", expanded);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.is_empty() {
            return Err(ConfigError::MissingKey("image"));
        }
        if self.scratch.is_empty() {
            return Err(ConfigError::MissingKey("scratch"));
        }
        if self.job_name_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::General(format!(
                "job_name_prefix '{}' must not contain whitespace",
                self.job_name_prefix
            )));
        }
        if self.min_array_size == 0 || self.max_array_size < self.min_array_size {
            return Err(ConfigError::General(format!(
                "array sizes must satisfy 0 < min_array_size ({}) <= max_array_size ({})",
                self.min_array_size, self.max_array_size
            )));
        }
        if self.describe_chunk_size == 0 {
            return Err(ConfigError::General(
                "describe_chunk_size must be at least 1".to_string(),
            ));
        }
        if let Some(interval) = self.job_monitor_interval {
            if !(interval > 0.0 && interval <= MAX_INTERVAL_SECS) {
                return Err(ConfigError::General(format!(
                    "job_monitor_interval must be in (0, {}] seconds, got {}",
                    MAX_INTERVAL_SECS, interval
                )));
            }
        }
        if !(self.job_stale_time >= 0.0 && self.job_stale_time <= MAX_INTERVAL_SECS) {
            return Err(ConfigError::General(format!(
                "job_stale_time must be in [0, {}] seconds, got {}",
                MAX_INTERVAL_SECS, self.job_stale_time
            )));
        }
        Ok(())
    }

    /// Local containers finish quickly, so debug mode polls more often.
    pub fn monitor_interval(&self) -> Duration {
        let secs = self
            .job_monitor_interval
            .unwrap_or(if self.debug { 0.2 } else { 5.0 });
        Duration::from_secs_f64(secs)
    }

    pub fn stale_time(&self) -> Duration {
        Duration::from_secs_f64(self.job_stale_time.max(0.0))
    }

    /// Executor-level layer of task options.
    pub fn default_task_options(&self) -> TaskOptions {
        TaskOptions {
            vcpus: Some(self.vcpus),
            memory: Some(self.memory),
            gpus: Some(self.gpus),
            retries: Some(self.retries),
            role: self.role.clone(),
            timeout: self.timeout,
            job_name_prefix: Some(self.job_name_prefix.clone()),
            cache: Some(true),
            image: Some(self.image.clone()),
            volumes: Vec::new(),
            tags: self.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
image = "registry.example.com/worker:1.2"
scratch = "/tmp/remex-scratch"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = EngineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.vcpus, 1);
        assert_eq!(config.memory, 4);
        assert_eq!(config.job_name_prefix, "remex-job");
        assert!(config.default_tags);
        assert_eq!(config.pending_truncate, 0);
        assert_eq!(config.monitor_interval(), Duration::from_secs(5));
        assert!(config.code_package.spec().is_some());
    }

    #[test]
    fn test_debug_monitor_interval() {
        let config =
            EngineConfig::from_toml_str(&format!("{}\ndebug = true\n", MINIMAL)).unwrap();
        assert_eq!(config.monitor_interval(), Duration::from_secs_f64(0.2));
    }

    #[test]
    fn test_code_package_disabled() {
        let config =
            EngineConfig::from_toml_str(&format!("{}\ncode_package = false\n", MINIMAL)).unwrap();
        assert!(config.code_package.spec().is_none());
    }

    #[test]
    fn test_code_package_table() {
        let content = format!(
            "{}\n[code_package]\nroot = \"src\"\ninclude = [\"*.py\"]\n",
            MINIMAL
        );
        let config = EngineConfig::from_toml_str(&content).unwrap();
        let spec = config.code_package.spec().unwrap();
        assert_eq!(spec.root, PathBuf::from("src"));
        assert_eq!(spec.include, vec!["*.py"]);
        assert!(spec.exclude.is_empty());
    }

    #[test]
    fn test_tags_table() {
        let content = format!("{}\n[tags]\nteam = \"genomics\"\n", MINIMAL);
        let config = EngineConfig::from_toml_str(&content).unwrap();
        assert_eq!(config.tags.get("team").map(String::as_str), Some("genomics"));
        assert_eq!(config.default_task_options().tags, config.tags);
    }

    #[test]
    fn test_missing_image_rejected() {
        let err = EngineConfig::from_toml_str("scratch = \"/tmp\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("image")));
    }

    #[test]
    fn test_invalid_array_sizes_rejected() {
        let content = format!("{}\nmin_array_size = 10\nmax_array_size = 2\n", MINIMAL);
        assert!(matches!(
            EngineConfig::from_toml_str(&content),
            Err(ConfigError::General(_))
        ));
    }

    #[test]
    fn test_out_of_range_intervals_rejected() {
        for extra in [
            "job_stale_time = 1e300",
            "job_stale_time = -1.0",
            "job_stale_time = nan",
            "job_monitor_interval = 1e300",
            "job_monitor_interval = 0.0",
        ] {
            let content = format!("{}\n{}\n", MINIMAL, extra);
            assert!(
                matches!(EngineConfig::from_toml_str(&content), Err(ConfigError::General(_))),
                "{} was accepted",
                extra
            );
        }
        let content = format!("{}\njob_stale_time = 0.0\n", MINIMAL);
        assert_eq!(
            EngineConfig::from_toml_str(&content).unwrap().stale_time(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_default_code_package_includes_everything() {
        let spec = CodePackageSpec::default();
        assert_eq!(spec.include, vec!["*"]);
        assert!(spec.exclude.is_empty());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remex.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(config.image, "registry.example.com/worker:1.2");
    }
}
