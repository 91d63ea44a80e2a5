//! Concurrent map from VNF identity to deployment state
//!
//! Each entry pairs a pass lock, which serialises reconcile passes for one
//! identity, with the state itself. Passes for different identities only
//! contend on the map's shard locks while looking an entry up.

use super::DeploymentState;
use crate::models::VnfKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// State for one VNF plus the lock that serialises its reconcile passes
#[derive(Debug, Default)]
pub struct StateEntry {
    pass_lock: Mutex<()>,
    state: RwLock<DeploymentState>,
}

impl StateEntry {
    /// Wait for exclusive access to run a reconcile pass
    pub async fn begin_pass(&self) -> MutexGuard<'_, ()> {
        self.pass_lock.lock().await
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> DeploymentState {
        self.state.read().await.clone()
    }

    /// Replace the whole state, used by a pass to commit its working copy
    pub async fn commit(&self, state: DeploymentState) {
        *self.state.write().await = state;
    }

    /// Apply an in-place change under the write lock
    pub async fn update<R>(&self, f: impl FnOnce(&mut DeploymentState) -> R) -> R {
        let mut guard = self.state.write().await;
        f(&mut guard)
    }
}

/// Registry of deployment state keyed by VNF identity
#[derive(Debug, Default)]
pub struct VnfStateStore {
    entries: DashMap<VnfKey, Arc<StateEntry>>,
}

impl VnfStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for `key`, creating a fresh one if absent
    ///
    /// Returns the entry and whether it was created by this call.
    pub fn get_or_create(&self, key: &VnfKey) -> (Arc<StateEntry>, bool) {
        if let Some(existing) = self.entries.get(key) {
            return (Arc::clone(existing.value()), false);
        }

        let mut created = false;
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(StateEntry::default())
            })
            .value()
            .clone();
        (entry, created)
    }

    pub fn get(&self, key: &VnfKey) -> Option<Arc<StateEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Whether `entry` is still the one registered for `key`
    pub fn is_current(&self, key: &VnfKey, entry: &Arc<StateEntry>) -> bool {
        self.entries
            .get(key)
            .map(|e| Arc::ptr_eq(e.value(), entry))
            .unwrap_or(false)
    }

    pub fn remove(&self, key: &VnfKey) -> Option<Arc<StateEntry>> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub async fn snapshot(&self, key: &VnfKey) -> Option<DeploymentState> {
        let entry = self.get(key)?;
        Some(entry.snapshot().await)
    }

    /// Apply an in-place change if state exists for `key`
    pub async fn update<R>(
        &self,
        key: &VnfKey,
        f: impl FnOnce(&mut DeploymentState) -> R,
    ) -> Option<R> {
        let entry = self.get(key)?;
        Some(entry.update(f).await)
    }

    pub fn keys(&self) -> Vec<VnfKey> {
        let mut keys: Vec<VnfKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Snapshots of every tracked VNF, ordered by key
    pub async fn snapshots(&self) -> Vec<(VnfKey, DeploymentState)> {
        // Collect the Arcs first so no shard lock is held across an await
        let mut entries: Vec<(VnfKey, Arc<StateEntry>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            out.push((key, entry.snapshot().await));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
