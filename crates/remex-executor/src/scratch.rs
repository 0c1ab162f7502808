use crate::command::ShellCommand;
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use remex_core::constants::dirs;
use remex_core::model::EvalHash;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScratchKey {
    Job { hash: EvalHash, kind: &'static str },
    Array { id: String, kind: &'static str },
    Code { digest: String },
}

impl ScratchKey {
    pub fn job(hash: &EvalHash, kind: &'static str) -> Self {
        ScratchKey::Job {
            hash: hash.clone(),
            kind,
        }
    }

    pub fn array(id: &str, kind: &'static str) -> Self {
        ScratchKey::Array {
            id: id.to_string(),
            kind,
        }
    }

    pub fn relative_path(&self) -> String {
        match self {
            ScratchKey::Job { hash, kind } => format!("{}/{}/{}", dirs::JOBS, hash, kind),
            ScratchKey::Array { id, kind } => format!("{}/{}/{}", dirs::ARRAY_JOBS, id, kind),
            ScratchKey::Code { digest } => format!("{}/{}.tar", dirs::CODE, digest),
        }
    }
}

impl fmt::Display for ScratchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path())
    }
}

/// Durable byte storage shared between the engine and remote executions.
#[async_trait]
pub trait Scratch: Send + Sync {
    /// Location of `key` as seen from inside a remote job.
    fn location(&self, key: &ScratchKey) -> String;

    async fn write(&self, key: &ScratchKey, data: &[u8]) -> Result<()>;

    async fn read(&self, key: &ScratchKey) -> Result<Vec<u8>>;

    async fn exists(&self, key: &ScratchKey) -> Result<bool>;

    async fn read_if_exists(&self, key: &ScratchKey) -> Result<Option<Vec<u8>>> {
        if self.exists(key).await? {
            self.read(key).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Shell command copying `key` to the local file `dest`.
    fn fetch_command(&self, key: &ScratchKey, dest: &str) -> ShellCommand;

    /// Shell command copying the local file `src` to `key`.
    fn store_command(&self, src: &str, key: &ScratchKey) -> ShellCommand;
}

/// Scratch rooted at a directory reachable by both the engine and its jobs
/// (a shared filesystem, or a volume mounted into local containers).
#[derive(Debug, Clone)]
pub struct FsScratch {
    root: PathBuf,
}

impl FsScratch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &ScratchKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

#[async_trait]
impl Scratch for FsScratch {
    fn location(&self, key: &ScratchKey) -> String {
        self.path(key).to_string_lossy().into_owned()
    }

    async fn write(&self, key: &ScratchKey, data: &[u8]) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        tracing::trace!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    async fn read(&self, key: &ScratchKey) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::ScratchMissing(self.location(key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &ScratchKey) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path(key)).await?)
    }

    fn fetch_command(&self, key: &ScratchKey, dest: &str) -> ShellCommand {
        ShellCommand::new("cp").arg(&self.location(key)).arg(dest)
    }

    fn store_command(&self, src: &str, key: &ScratchKey) -> ShellCommand {
        let target = self.path(key);
        let parent = target
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        ShellCommand::new("mkdir")
            .arg("-p")
            .arg(&parent)
            .and(ShellCommand::new("cp").arg(src).arg(&self.location(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_core::constants::payloads;
    use tempfile::tempdir;

    #[test]
    fn test_key_layout() {
        let hash = EvalHash::from("abc");
        assert_eq!(
            ScratchKey::job(&hash, payloads::OUTPUT).relative_path(),
            "jobs/abc/output"
        );
        assert_eq!(
            ScratchKey::array("f00d", payloads::EVAL_HASHES).relative_path(),
            "array_jobs/f00d/eval_hashes"
        );
        assert_eq!(
            ScratchKey::Code {
                digest: "123".into()
            }
            .relative_path(),
            "code/123.tar"
        );
    }

    #[tokio::test]
    async fn test_fs_scratch_write_read() {
        let dir = tempdir().unwrap();
        let scratch = FsScratch::new(dir.path());
        let key = ScratchKey::job(&EvalHash::from("h1"), payloads::INPUT);

        assert!(!scratch.exists(&key).await.unwrap());
        assert_eq!(scratch.read_if_exists(&key).await.unwrap(), None);

        scratch.write(&key, b"[[1],{}]").await.unwrap();
        assert!(scratch.exists(&key).await.unwrap());
        assert_eq!(scratch.read(&key).await.unwrap(), b"[[1],{}]");
        assert!(dir.path().join("jobs/h1/input").is_file());
    }

    #[tokio::test]
    async fn test_fs_scratch_missing_read() {
        let dir = tempdir().unwrap();
        let scratch = FsScratch::new(dir.path());
        let key = ScratchKey::job(&EvalHash::from("nope"), payloads::OUTPUT);
        assert!(matches!(
            scratch.read(&key).await,
            Err(BackendError::ScratchMissing(_))
        ));
    }

    #[test]
    fn test_store_command_creates_parent() {
        let scratch = FsScratch::new("/scratch");
        let key = ScratchKey::job(&EvalHash::from("h2"), payloads::STATUS);
        assert_eq!(
            scratch.store_command(".task_status", &key).to_shell_string(),
            "mkdir '-p' '/scratch/jobs/h2' && cp '.task_status' '/scratch/jobs/h2/status'"
        );
    }
}
