//! Find-or-create table for shared services.
//!
//! Each key owns an `Arc<OnceCell>`. The map lock is only held long enough
//! to fetch or insert the cell; the create itself runs inside the cell, so
//! concurrent callers for one key wait on the same initialization while
//! other keys proceed in parallel. A failed create leaves the cell empty
//! and the next caller tries again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OnceCell};

use crate::provider::{ProviderError, ProviderResult};

pub struct ServiceRegistry<H> {
    cells: Mutex<HashMap<String, Arc<OnceCell<H>>>>,
}

impl<H: Clone + Send + Sync> ServiceRegistry<H> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the handle for `key`, running `create` if nobody has yet.
    ///
    /// The flag is `true` for the one caller whose `create` produced the
    /// handle.
    pub async fn get_or_create<F, Fut>(&self, key: &str, create: F) -> ProviderResult<(H, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProviderResult<H>>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let initialized_here = AtomicBool::new(false);
        let handle = cell
            .get_or_try_init(|| async {
                let handle = create().await?;
                initialized_here.store(true, Ordering::SeqCst);
                Ok::<H, ProviderError>(handle)
            })
            .await?;
        Ok((handle.clone(), initialized_here.load(Ordering::SeqCst)))
    }

    /// The cached handle, without creating one.
    pub async fn get(&self, key: &str) -> Option<H> {
        let cell = self.cells.lock().await.get(key).cloned();
        cell.and_then(|c| c.get().cloned())
    }

    /// Forgets `key`, e.g. after the provider reported the service gone.
    pub async fn invalidate(&self, key: &str) {
        self.cells.lock().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        let cells: Vec<_> = self.cells.lock().await.values().cloned().collect();
        cells.iter().filter(|c| c.initialized()).count()
    }
}

impl<H: Clone + Send + Sync> Default for ServiceRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
