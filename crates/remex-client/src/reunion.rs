use crate::error::Result;
use futures::future::try_join_all;
use remex_core::constants::payloads;
use remex_core::model::{EvalHash, RemoteJobId};
use remex_core::naming::{hash_from_job_name, is_array_job_name};
use remex_executor::{ClusterClient, Scratch, ScratchKey, StatusRecord};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Eval hash to remote job id, seeded once from the jobs already inflight
/// on the cluster. Every entry is handed out at most once.
#[derive(Default)]
pub struct ReunionCache {
    entries: Mutex<HashMap<EvalHash, RemoteJobId>>,
}

impl ReunionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EvalHash, RemoteJobId>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records every inflight job named `{prefix}-{hash}` and every inflight
    /// member of an array job whose hash list is still in scratch.
    /// Jobs may override the name prefix, so all inflight names are parsed.
    /// Returns the number of entries added.
    pub async fn scan(&self, client: &dyn ClusterClient, scratch: &dyn Scratch) -> Result<usize> {
        let records = client.list_all("").await?;
        let mut found: Vec<(EvalHash, RemoteJobId)> = Vec::new();
        let mut arrays: Vec<&StatusRecord> = Vec::new();

        for record in &records {
            if is_array_job_name(&record.name) {
                arrays.push(record);
            } else if let Some(hash) = hash_from_job_name(&record.name) {
                found.push((EvalHash::from(hash), record.id.clone()));
            }
        }

        let array_entries = try_join_all(
            arrays
                .into_iter()
                .map(|record| scan_array(client, scratch, record)),
        )
        .await?;
        found.extend(array_entries.into_iter().flatten());

        let count = found.len();
        let mut entries = self.lock();
        for (hash, id) in found {
            entries.insert(hash, id);
        }
        tracing::info!(
            "Reunion scan found {} of {} inflight jobs",
            count,
            records.len()
        );
        Ok(count)
    }

    pub fn lookup_and_claim(&self, hash: &EvalHash) -> Option<RemoteJobId> {
        self.lock().remove(hash)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Array jobs are named after their uuid, which also keys their hash list.
async fn scan_array(
    client: &dyn ClusterClient,
    scratch: &dyn Scratch,
    record: &StatusRecord,
) -> Result<Vec<(EvalHash, RemoteJobId)>> {
    let Some(array_uuid) = hash_from_job_name(&record.name) else {
        return Ok(Vec::new());
    };
    let key = ScratchKey::array(array_uuid, payloads::EVAL_HASHES);
    let Some(data) = scratch.read_if_exists(&key).await? else {
        tracing::debug!(
            "Skipping array job {}: no hash list at {}",
            record.id,
            scratch.location(&key)
        );
        return Ok(Vec::new());
    };
    let hashes: Vec<String> = String::from_utf8_lossy(&data)
        .lines()
        .map(str::to_string)
        .collect();

    let members = client.array_members(record).await?;
    Ok(members
        .into_iter()
        .filter_map(|(member, index)| {
            hashes
                .get(index)
                .filter(|h| !h.is_empty())
                .map(|h| (EvalHash::from(h.as_str()), member))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_core::naming::job_name;
    use remex_test_utils::{FakeCluster, MemoryScratch};

    #[tokio::test]
    async fn test_scan_single_jobs_and_claim_once() {
        let cluster = FakeCluster::new();
        cluster.add_inflight("r-1", &job_name("remex-job", "aaa", false));
        cluster.add_inflight("r-2", &job_name("remex-job", "bbb", false));
        cluster.add_inflight("r-3", &job_name("nightly", "ccc", false));
        cluster.add_inflight("r-4", "headnode");
        let scratch = MemoryScratch::new();

        let cache = ReunionCache::new();
        assert_eq!(cache.scan(&cluster, &scratch).await.unwrap(), 3);

        let hash = EvalHash::from("aaa");
        assert_eq!(cache.lookup_and_claim(&hash), Some(RemoteJobId::from("r-1")));
        assert_eq!(cache.lookup_and_claim(&hash), None);
        assert_eq!(
            cache.lookup_and_claim(&EvalHash::from("ccc")),
            Some(RemoteJobId::from("r-3"))
        );
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_array_members_by_index() {
        let cluster = FakeCluster::new();
        cluster.add_inflight("arr-9", &job_name("remex-job", "f00d", true));
        cluster.add_array_members("arr-9", &[0, 2]);
        let scratch = MemoryScratch::new();
        scratch.put(
            &ScratchKey::array("f00d", payloads::EVAL_HASHES),
            "h0\nh1\nh2\n",
        );

        let cache = ReunionCache::new();
        assert_eq!(cache.scan(&cluster, &scratch).await.unwrap(), 2);
        assert_eq!(
            cache.lookup_and_claim(&EvalHash::from("h2")),
            Some(RemoteJobId::from("arr-9:2"))
        );
        assert_eq!(cache.lookup_and_claim(&EvalHash::from("h1")), None);
    }

    #[tokio::test]
    async fn test_scan_skips_array_without_hash_list() {
        let cluster = FakeCluster::new();
        cluster.add_inflight("arr-1", &job_name("remex-job", "beef", true));
        cluster.add_array_members("arr-1", &[0]);
        let cache = ReunionCache::new();
        assert_eq!(
            cache.scan(&cluster, &MemoryScratch::new()).await.unwrap(),
            0
        );
        assert!(cache.is_empty());
    }
}
