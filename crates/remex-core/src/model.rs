use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::DomainError;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of a task and its inputs. Embedded in remote job names.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct EvalHash(pub String);

impl fmt::Display for EvalHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EvalHash {
    fn from(s: &str) -> Self {
        EvalHash(s.to_string())
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct RemoteJobId(pub String);

impl RemoteJobId {
    pub fn array_member(array_id: &str, index: usize) -> Self {
        RemoteJobId(format!("{}:{}", array_id, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RemoteJobId {
    fn from(s: &str) -> Self {
        RemoteJobId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Cluster,
    LocalContainer,
}

impl BackendKind {
    pub fn is_local(&self) -> bool {
        matches!(self, BackendKind::LocalContainer)
    }

    pub fn describe_job_type(&self) -> &'static str {
        match self {
            BackendKind::Cluster => "cluster job",
            BackendKind::LocalContainer => "local container",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cluster => write!(f, "cluster"),
            BackendKind::LocalContainer => write!(f, "local-container"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseBackendKindError(pub String);

impl fmt::Display for ParseBackendKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid backend kind: '{}'. Valid values are: cluster, local-container",
            self.0
        )
    }
}

impl std::error::Error for ParseBackendKindError {}

impl FromStr for BackendKind {
    type Err = ParseBackendKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(BackendKind::Cluster),
            "local-container" => Ok(BackendKind::LocalContainer),
            _ => Err(ParseBackendKindError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TaskKind {
    /// Invoked through the oneshot runner with serialized arguments.
    Structured,
    /// Renders a shell command from `template` and the call arguments.
    Script { template: String },
}

impl TaskKind {
    pub fn is_script(&self) -> bool {
        matches!(self, TaskKind::Script { .. })
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Structured => write!(f, "structured"),
            TaskKind::Script { .. } => write!(f, "script"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Module the remote runner loads before calling the task.
    pub module: String,
    pub kind: TaskKind,
}

impl TaskDef {
    pub fn structured(namespace: Option<&str>, name: &str, module: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            module: module.to_string(),
            kind: TaskKind::Structured,
        }
    }

    pub fn script(namespace: Option<&str>, name: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            module: String::new(),
            kind: TaskKind::Script {
                template: template.to_string(),
            },
        }
    }

    pub fn fullname(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{}.{}", ns, self.name),
            _ => self.name.clone(),
        }
    }

    /// Materializes the shell command of a script task.
    ///
    /// `{0}`, `{1}`, ... refer to positional arguments and `{name}` to named
    /// ones. String values are inserted verbatim, other values as JSON.
    /// `{{` and `}}` produce literal braces.
    pub fn render_command(&self, args: &TaskArgs) -> Result<String, DomainError> {
        let template = match &self.kind {
            TaskKind::Script { template } => template,
            TaskKind::Structured => return Err(DomainError::NotAScript(self.fullname())),
        };

        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut key = String::new();
                    let mut closed = false;
                    for k in chars.by_ref() {
                        if k == '}' {
                            closed = true;
                            break;
                        }
                        key.push(k);
                    }
                    if !closed {
                        return Err(DomainError::InvalidTemplate {
                            task: self.fullname(),
                            reason: "unterminated placeholder".to_string(),
                        });
                    }
                    let value = args.lookup(&key).ok_or_else(|| DomainError::MissingArgument {
                        task: self.fullname(),
                        name: key.clone(),
                    })?;
                    match value {
                        Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        match key.parse::<usize>() {
            Ok(index) => self.args.get(index),
            Err(_) => self.kwargs.get(key),
        }
    }
}

/// Per-job or executor-level option overrides. Unset fields fall through to
/// the next layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskOptions {
    pub vcpus: Option<u32>,
    /// GiB.
    pub memory: Option<u32>,
    pub gpus: Option<u32>,
    pub retries: Option<u32>,
    pub role: Option<String>,
    /// Seconds.
    pub timeout: Option<u64>,
    pub job_name_prefix: Option<String>,
    pub cache: Option<bool>,
    pub image: Option<String>,
    #[serde(default)]
    pub volumes: Vec<(String, String)>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LogicalJob {
    pub id: JobId,
    pub eval_hash: EvalHash,
    pub task: Arc<TaskDef>,
    pub options: TaskOptions,
    pub execution_id: Option<String>,
    /// Namespace of the task that started the owning execution.
    pub project: Option<String>,
}

impl LogicalJob {
    pub fn new(id: &str, eval_hash: &str, task: Arc<TaskDef>) -> Self {
        Self {
            id: JobId(id.to_string()),
            eval_hash: EvalHash(eval_hash.to_string()),
            task,
            options: TaskOptions::default(),
            execution_id: None,
            project: None,
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_execution(mut self, execution_id: &str, project: Option<&str>) -> Self {
        self.execution_id = Some(execution_id.to_string());
        self.project = project.map(str::to_string);
        self
    }

    pub fn is_script(&self) -> bool {
        self.task.kind.is_script()
    }
}

impl fmt::Display for LogicalJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.task.fullname())
    }
}

pub type JobTags = Vec<(String, String)>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fullname_with_namespace() {
        let task = TaskDef::structured(Some("bio"), "align", "bio.tasks");
        assert_eq!(task.fullname(), "bio.align");
    }

    #[test]
    fn test_fullname_without_namespace() {
        let task = TaskDef::structured(None, "align", "tasks");
        assert_eq!(task.fullname(), "align");
    }

    #[test]
    fn test_render_command_positional_and_named() {
        let task = TaskDef::script(None, "count", "wc -l {0} > {out}");
        let mut kwargs = BTreeMap::new();
        kwargs.insert("out".to_string(), json!("counts.txt"));
        let args = TaskArgs::new(vec![json!("reads.fq")], kwargs);
        assert_eq!(
            task.render_command(&args).unwrap(),
            "wc -l reads.fq > counts.txt"
        );
    }

    #[test]
    fn test_render_command_non_string_values_and_escapes() {
        let task = TaskDef::script(None, "loop", "for i in $(seq {0}); do echo {{}}; done");
        let args = TaskArgs::positional(vec![json!(3)]);
        assert_eq!(
            task.render_command(&args).unwrap(),
            "for i in $(seq 3); do echo {}; done"
        );
    }

    #[test]
    fn test_render_command_missing_argument() {
        let task = TaskDef::script(None, "echo", "echo {1}");
        let args = TaskArgs::positional(vec![json!("a")]);
        assert!(matches!(
            task.render_command(&args),
            Err(DomainError::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_render_command_on_structured_task() {
        let task = TaskDef::structured(None, "f", "m");
        assert!(matches!(
            task.render_command(&TaskArgs::default()),
            Err(DomainError::NotAScript(_))
        ));
    }

    #[test]
    fn test_remote_job_id_array_member() {
        assert_eq!(RemoteJobId::array_member("abc", 3).0, "abc:3");
    }

    #[test]
    fn test_backend_kind_round_trip() {
        for kind in [BackendKind::Cluster, BackendKind::LocalContainer] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("k8s".parse::<BackendKind>().is_err());
    }
}
