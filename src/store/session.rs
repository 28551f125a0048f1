use super::{DocumentStore, TableRef, validate_name};
use crate::error::{AtlasError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Hands out one session per dataset at a time. A dataset's lock lives only while a
/// session holds or waits for it.
pub struct Sessions {
    store: Arc<dyn DocumentStore>,
    locks: LockMap,
}

impl Sessions {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Sessions {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    /// Waits until no other session holds `dataset`, then returns a session for it.
    pub async fn acquire(&self, dataset: &str) -> Result<DatasetSession> {
        validate_name(dataset)?;

        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|e| AtlasError::Storage(format!("Failed to lock session table: {}", e)))?;
            Arc::clone(locks.entry(dataset.to_string()).or_default())
        };

        let guard = lock.lock_owned().await;
        debug!(dataset, "session acquired");

        Ok(DatasetSession {
            dataset: dataset.to_string(),
            store: Arc::clone(&self.store),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        })
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }
}

/// Store access scoped to one dataset. Dropping it releases the dataset.
pub struct DatasetSession {
    dataset: String,
    store: Arc<dyn DocumentStore>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl DatasetSession {
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn table(&self, name: &str) -> Result<TableRef> {
        TableRef::new(&self.dataset, name)
    }
}

impl Drop for DatasetSession {
    fn drop(&mut self) {
        drop(self.guard.take());

        // the map's own reference is the last one once nobody holds or waits for the lock
        if let Ok(mut locks) = self.locks.lock() {
            if let Some(lock) = locks.get(&self.dataset) {
                if Arc::strong_count(lock) == 1 {
                    locks.remove(&self.dataset);
                }
            }
        }
        debug!(dataset = %self.dataset, "session released");
    }
}
