use remex_core::model::{LogicalJob, RemoteJobId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    order: BTreeMap<u64, RemoteJobId>,
    entries: HashMap<RemoteJobId, (u64, Arc<LogicalJob>)>,
}

/// Insertion-ordered map of in-flight remote jobs to the logical jobs they
/// run. Ids are removed once, when their terminal status is classified.
#[derive(Default)]
pub struct PendingRegistry {
    inner: Mutex<Inner>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false, leaving the registry unchanged, when `id` is already
    /// pending.
    pub fn insert(&self, id: RemoteJobId, job: Arc<LogicalJob>) -> bool {
        let mut inner = self.lock();
        if inner.entries.contains_key(&id) {
            tracing::warn!("Remote job {} is already pending; ignoring duplicate", id);
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, id.clone());
        inner.entries.insert(id, (seq, job));
        true
    }

    pub fn get(&self, id: &RemoteJobId) -> Option<Arc<LogicalJob>> {
        self.lock().entries.get(id).map(|(_, job)| job.clone())
    }

    pub fn remove(&self, id: &RemoteJobId) -> Option<Arc<LogicalJob>> {
        let mut inner = self.lock();
        let (seq, job) = inner.entries.remove(id)?;
        inner.order.remove(&seq);
        Some(job)
    }

    /// Snapshot of pending ids, oldest first.
    pub fn ids_in_order(&self) -> Vec<RemoteJobId> {
        self.lock().order.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_core::model::TaskDef;

    fn job(id: &str) -> Arc<LogicalJob> {
        let task = Arc::new(TaskDef::structured(None, "t", "m"));
        Arc::new(LogicalJob::new(id, id, task))
    }

    #[test]
    fn test_insertion_order_survives_removal() {
        let registry = PendingRegistry::new();
        for id in ["c", "a", "b"] {
            assert!(registry.insert(RemoteJobId::from(id), job(id)));
        }
        registry.remove(&RemoteJobId::from("a"));
        assert_eq!(
            registry.ids_in_order(),
            vec![RemoteJobId::from("c"), RemoteJobId::from("b")]
        );
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let registry = PendingRegistry::new();
        let id = RemoteJobId::from("r1");
        registry.insert(id.clone(), job("1"));
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let registry = PendingRegistry::new();
        let id = RemoteJobId::from("r1");
        assert!(registry.insert(id.clone(), job("1")));
        assert!(!registry.insert(id.clone(), job("2")));
        assert_eq!(registry.get(&id).unwrap().id.0, "1");
        assert_eq!(registry.len(), 1);
    }
}
