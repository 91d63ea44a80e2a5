//! Declarative object store holding VNF intents
//!
//! The engine reads intents and writes observed status through
//! [`ObjectStore`]. `MemoryObjectStore` is the in-process implementation
//! used by the operator binary and the tests; it behaves like an API server
//! for the parts the engine relies on: generation bumps on spec changes,
//! finalizer-gated deletion and change notifications.

use crate::error::{LifecycleError, LifecycleResult};
use crate::models::{VnfIntent, VnfKey, VnfSpec, VnfStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Access to stored VNF intents
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &VnfKey) -> LifecycleResult<VnfIntent>;

    async fn update_status(&self, key: &VnfKey, status: VnfStatus) -> LifecycleResult<()>;

    /// Write back metadata changes. Only the finalizer list is honoured.
    async fn update(&self, intent: &VnfIntent) -> LifecycleResult<()>;

    async fn list(&self) -> LifecycleResult<Vec<VnfKey>>;
}

/// In-memory object store
#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<VnfKey, VnfIntent>>,
    changes: broadcast::Sender<VnfKey>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Keys of objects whose spec or deletion flag changed
    pub fn subscribe(&self) -> broadcast::Receiver<VnfKey> {
        self.changes.subscribe()
    }

    fn notify(&self, key: &VnfKey) {
        // No receivers is fine: nobody is watching yet
        let _ = self.changes.send(key.clone());
    }

    /// Create or replace the spec of an intent
    ///
    /// The generation is incremented whenever the spec actually changes.
    pub fn apply(&self, key: &VnfKey, spec: VnfSpec) -> LifecycleResult<VnfIntent> {
        let intent = {
            let mut objects = self
                .objects
                .write()
                .map_err(|_| LifecycleError::store("lock poisoned"))?;

            match objects.get_mut(key) {
                Some(existing) if existing.metadata.deletion_requested => {
                    return Err(LifecycleError::store(format!("{} is being deleted", key)));
                }
                Some(existing) => {
                    if existing.spec == spec {
                        return Ok(existing.clone());
                    }
                    existing.spec = spec;
                    existing.metadata.generation += 1;
                    existing.clone()
                }
                None => {
                    let intent = VnfIntent::new(key, spec);
                    objects.insert(key.clone(), intent.clone());
                    intent
                }
            }
        };

        debug!(vnf = %key, generation = intent.metadata.generation, "Intent applied");
        self.notify(key);
        Ok(intent)
    }

    /// Mark an intent for deletion; it disappears once its finalizers are gone
    pub fn request_deletion(&self, key: &VnfKey) -> LifecycleResult<()> {
        {
            let mut objects = self
                .objects
                .write()
                .map_err(|_| LifecycleError::store("lock poisoned"))?;

            let intent = objects
                .get_mut(key)
                .ok_or_else(|| LifecycleError::NotFound(format!("VNF {}", key)))?;
            intent.metadata.deletion_requested = true;
            if intent.metadata.finalizers.is_empty() {
                objects.remove(key);
            }
        }

        debug!(vnf = %key, "Deletion requested");
        self.notify(key);
        Ok(())
    }

    pub fn contains(&self, key: &VnfKey) -> bool {
        self.objects
            .read()
            .map(|o| o.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &VnfKey) -> LifecycleResult<VnfIntent> {
        let objects = self
            .objects
            .read()
            .map_err(|_| LifecycleError::store("lock poisoned"))?;

        objects
            .get(key)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound(format!("VNF {}", key)))
    }

    async fn update_status(&self, key: &VnfKey, status: VnfStatus) -> LifecycleResult<()> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| LifecycleError::store("lock poisoned"))?;

        let intent = objects
            .get_mut(key)
            .ok_or_else(|| LifecycleError::NotFound(format!("VNF {}", key)))?;
        intent.status = status;
        Ok(())
    }

    async fn update(&self, updated: &VnfIntent) -> LifecycleResult<()> {
        let key = updated.key();
        let mut objects = self
            .objects
            .write()
            .map_err(|_| LifecycleError::store("lock poisoned"))?;

        let intent = objects
            .get_mut(&key)
            .ok_or_else(|| LifecycleError::NotFound(format!("VNF {}", key)))?;
        intent.metadata.finalizers = updated.metadata.finalizers.clone();

        if intent.metadata.deletion_requested && intent.metadata.finalizers.is_empty() {
            objects.remove(&key);
            debug!(vnf = %key, "Object removed after finalizers cleared");
        }
        Ok(())
    }

    async fn list(&self) -> LifecycleResult<Vec<VnfKey>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| LifecycleError::store("lock poisoned"))?;
        Ok(objects.keys().cloned().collect())
    }
}
