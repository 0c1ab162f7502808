pub mod markers {
    pub const OK: &str = "ok";
    pub const FAIL: &str = "fail";
}

pub mod payloads {
    pub const INPUT: &str = "input";
    pub const OUTPUT: &str = "output";
    pub const ERROR: &str = "error";
    pub const STATUS: &str = "status";
    pub const EVAL_HASHES: &str = "eval_hashes";
}

pub mod dirs {
    pub const JOBS: &str = "jobs";
    pub const ARRAY_JOBS: &str = "array_jobs";
    pub const CODE: &str = "code";
}

pub mod naming {
    pub const ARRAY_JOB_SUFFIX: &str = "array";
    pub const DEFAULT_JOB_NAME_PREFIX: &str = "remex-job";
}

/// Failure-reason texts emitted by the cluster that the classifier recognizes.
pub mod reasons {
    pub const CONTAINER_INSPECT: &str =
        "CannotInspectContainerError: Could not transition to inspecting";
    pub const JOB_TIMEOUT: &str = "Job attempt duration exceeded timeout";
}

pub mod tags {
    pub const REMOTE_JOB: &str = "remote_job";
    pub const LOG_STREAM: &str = "log_stream";
    pub const JOB_ID: &str = "remex_job_id";
    pub const TASK_NAME: &str = "remex_task_name";
    pub const EXECUTION_ID: &str = "remex_execution_id";
    pub const PROJECT: &str = "remex_project";
    pub const USER: &str = "remex_user";
}

pub mod env {
    pub const ARRAY_INDEX: &str = "REMEX_ARRAY_INDEX";
    pub const LOG_LEVEL: &str = "REMEX_LOG_LEVEL";
}

pub mod logs {
    pub const TRUNCATED: &str = "\n*** Earlier logs are truncated ***\n";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_constants() {
        assert_eq!(markers::OK, "ok");
        assert_eq!(markers::FAIL, "fail");
    }

    #[test]
    fn test_payload_constants() {
        assert_eq!(payloads::OUTPUT, "output");
        assert_eq!(payloads::EVAL_HASHES, "eval_hashes");
    }

    #[test]
    fn test_array_suffix_has_no_dash() {
        assert!(!naming::ARRAY_JOB_SUFFIX.contains('-'));
    }
}
