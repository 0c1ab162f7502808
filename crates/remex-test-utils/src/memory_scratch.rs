use async_trait::async_trait;
use remex_core::model::EvalHash;
use remex_executor::{BackendError, Result, Scratch, ScratchKey, ShellCommand};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Scratch store kept in a map, addressed as `mem://{relative path}`.
#[derive(Default)]
pub struct MemoryScratch {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &ScratchKey, data: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.relative_path(), data.into());
    }

    pub fn put_job(&self, hash: &str, kind: &'static str, data: impl Into<Vec<u8>>) {
        self.put(&ScratchKey::job(&EvalHash::from(hash), kind), data);
    }

    pub fn get(&self, key: &ScratchKey) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(&key.relative_path()).cloned()
    }

    pub fn get_string(&self, key: &ScratchKey) -> Option<String> {
        self.get(key).map(|d| String::from_utf8_lossy(&d).into_owned())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl Scratch for MemoryScratch {
    fn location(&self, key: &ScratchKey) -> String {
        format!("mem://{}", key.relative_path())
    }

    async fn write(&self, key: &ScratchKey, data: &[u8]) -> Result<()> {
        self.put(key, data.to_vec());
        Ok(())
    }

    async fn read(&self, key: &ScratchKey) -> Result<Vec<u8>> {
        self.get(key)
            .ok_or_else(|| BackendError::ScratchMissing(self.location(key)))
    }

    async fn exists(&self, key: &ScratchKey) -> Result<bool> {
        Ok(self.get(key).is_some())
    }

    fn fetch_command(&self, key: &ScratchKey, dest: &str) -> ShellCommand {
        ShellCommand::new("mem-get").arg(&self.location(key)).arg(dest)
    }

    fn store_command(&self, src: &str, key: &ScratchKey) -> ShellCommand {
        ShellCommand::new("mem-put").arg(src).arg(&self.location(key))
    }
}
