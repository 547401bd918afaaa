//! Session → customer bindings kept in the shared store under
//! `session:<sessionId>:customer`. Written by the external login flow; the
//! gateway only reads them.

use crate::store::SharedStore;
use std::sync::Arc;
use std::time::Duration;
use wattgate_core::{CustomerId, StoreResult};

#[derive(Clone)]
pub struct BindingStore {
    store: Arc<dyn SharedStore>,
}

impl BindingStore {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn key(session_id: &str) -> String {
        format!("session:{}:customer", session_id)
    }

    /// The customer bound to `session_id`, if any. Blank values count as absent.
    pub async fn customer_for(&self, session_id: &str) -> StoreResult<Option<CustomerId>> {
        let value = self.store.get(&Self::key(session_id)).await?;
        Ok(value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()))
    }

    pub async fn bind(
        &self,
        session_id: &str,
        customer_id: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        self.store
            .set(&Self::key(session_id), customer_id, ttl)
            .await
    }

    pub async fn unbind(&self, session_id: &str) -> StoreResult<()> {
        self.store.delete(&Self::key(session_id)).await
    }
}

impl std::fmt::Debug for BindingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingStore")
            .field("backend", &self.store.backend_name())
            .finish()
    }
}
