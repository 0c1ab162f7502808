use remex_core::constants::naming::DEFAULT_JOB_NAME_PREFIX;
use remex_core::constants::tags;
use remex_core::model::{LogicalJob, TaskOptions};
use remex_executor::ResourceRequest;
use std::collections::BTreeMap;

/// Acting identity attached to jobs as default tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: Option<String>,
}

impl Identity {
    pub fn current() -> Self {
        Self {
            user: whoami::fallible::username().ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub vcpus: u32,
    pub memory: u32,
    pub gpus: u32,
    pub retries: u32,
    pub role: Option<String>,
    pub timeout: Option<u64>,
    pub job_name_prefix: String,
    pub cache: bool,
    pub image: String,
    pub volumes: Vec<(String, String)>,
    pub tags: BTreeMap<String, String>,
}

impl ResolvedOptions {
    pub fn resources(&self) -> ResourceRequest {
        ResourceRequest {
            vcpus: self.vcpus,
            memory_gib: self.memory,
            gpus: self.gpus,
            retries: self.retries,
            role: self.role.clone(),
            timeout_secs: self.timeout,
        }
    }
}

fn identity_tags(job: &LogicalJob, identity: &Identity) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(tags::JOB_ID.to_string(), job.id.to_string());
    out.insert(tags::TASK_NAME.to_string(), job.task.fullname());
    if let Some(execution_id) = &job.execution_id {
        out.insert(tags::EXECUTION_ID.to_string(), execution_id.clone());
    }
    if let Some(project) = &job.project {
        out.insert(tags::PROJECT.to_string(), project.clone());
    }
    if let Some(user) = &identity.user {
        out.insert(tags::USER.to_string(), user.clone());
    }
    out
}

/// Layers the job's overrides on top of the executor defaults.
///
/// Scalars take the job's value when set. Tags are merged key by key:
/// executor tags, then identity tags (when `default_tags` is on), then the
/// job's own tags.
pub fn resolve_options(
    defaults: &TaskOptions,
    job: &LogicalJob,
    default_tags: bool,
    identity: &Identity,
) -> ResolvedOptions {
    let overrides = &job.options;

    let mut merged_tags = defaults.tags.clone();
    if default_tags {
        merged_tags.extend(identity_tags(job, identity));
    }
    merged_tags.extend(overrides.tags.clone());

    let volumes = if overrides.volumes.is_empty() {
        defaults.volumes.clone()
    } else {
        overrides.volumes.clone()
    };

    let resolved = ResolvedOptions {
        vcpus: overrides.vcpus.or(defaults.vcpus).unwrap_or(1),
        memory: overrides.memory.or(defaults.memory).unwrap_or(4),
        gpus: overrides.gpus.or(defaults.gpus).unwrap_or(0),
        retries: overrides.retries.or(defaults.retries).unwrap_or(1),
        role: overrides.role.clone().or_else(|| defaults.role.clone()),
        timeout: overrides.timeout.or(defaults.timeout),
        job_name_prefix: overrides
            .job_name_prefix
            .clone()
            .or_else(|| defaults.job_name_prefix.clone())
            .unwrap_or_else(|| DEFAULT_JOB_NAME_PREFIX.to_string()),
        cache: overrides.cache.or(defaults.cache).unwrap_or(true),
        image: overrides
            .image
            .clone()
            .or_else(|| defaults.image.clone())
            .unwrap_or_default(),
        volumes,
        tags: merged_tags,
    };

    tracing::debug!("Resolved options for job '{}': {:?}", job.id, resolved);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_core::model::TaskDef;
    use std::sync::Arc;

    fn tags_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn job(options: TaskOptions) -> LogicalJob {
        let task = Arc::new(TaskDef::structured(Some("bio"), "align", "bio.tasks"));
        LogicalJob::new("job-7", "abc", task)
            .with_execution("exec-1", Some("bio"))
            .with_options(options)
    }

    #[test]
    fn test_tag_merge_precedence() {
        let defaults = TaskOptions {
            tags: tags_of(&[("a", "1"), ("b", "2")]),
            ..Default::default()
        };
        let job = job(TaskOptions {
            tags: tags_of(&[("b", "3"), ("c", "4")]),
            ..Default::default()
        });
        let resolved = resolve_options(&defaults, &job, false, &Identity::default());
        assert_eq!(resolved.tags, tags_of(&[("a", "1"), ("b", "3"), ("c", "4")]));
    }

    #[test]
    fn test_job_vcpus_override_default() {
        let defaults = TaskOptions {
            vcpus: Some(2),
            memory: Some(8),
            ..Default::default()
        };
        let job = job(TaskOptions {
            vcpus: Some(16),
            ..Default::default()
        });
        let resolved = resolve_options(&defaults, &job, false, &Identity::default());
        assert_eq!(resolved.vcpus, 16);
        assert_eq!(resolved.memory, 8);
        assert_eq!(resolved.gpus, 0);
        assert!(resolved.cache);
        assert_eq!(resolved.job_name_prefix, "remex-job");
    }

    #[test]
    fn test_identity_tags_between_executor_and_job_tags() {
        let defaults = TaskOptions {
            tags: tags_of(&[(tags::USER, "from-config"), ("team", "x")]),
            ..Default::default()
        };
        let job = job(TaskOptions {
            tags: tags_of(&[(tags::PROJECT, "override")]),
            ..Default::default()
        });
        let identity = Identity {
            user: Some("alice".into()),
        };
        let resolved = resolve_options(&defaults, &job, true, &identity);

        assert_eq!(resolved.tags[tags::USER], "alice");
        assert_eq!(resolved.tags[tags::PROJECT], "override");
        assert_eq!(resolved.tags[tags::JOB_ID], "job-7");
        assert_eq!(resolved.tags[tags::TASK_NAME], "bio.align");
        assert_eq!(resolved.tags[tags::EXECUTION_ID], "exec-1");
        assert_eq!(resolved.tags["team"], "x");
    }

    #[test]
    fn test_no_identity_tags_when_disabled() {
        let resolved = resolve_options(
            &TaskOptions::default(),
            &job(TaskOptions::default()),
            false,
            &Identity {
                user: Some("alice".into()),
            },
        );
        assert!(resolved.tags.is_empty());
    }

    #[test]
    fn test_cache_can_be_disabled_per_job() {
        let defaults = TaskOptions {
            cache: Some(true),
            ..Default::default()
        };
        let job = job(TaskOptions {
            cache: Some(false),
            ..Default::default()
        });
        assert!(!resolve_options(&defaults, &job, true, &Identity::default()).cache);
    }
}
