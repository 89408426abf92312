use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::traits::CredentialProvider;

/// Wraps a credential provider so that reads are serialized per provider
/// name. Concurrent streams asking for the same provider's secret queue
/// behind one another; different providers do not contend.
pub struct SerializedCredentials {
    inner: Arc<dyn CredentialProvider>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SerializedCredentials {
    pub fn new(inner: Arc<dyn CredentialProvider>) -> Self {
        Self {
            inner,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl CredentialProvider for SerializedCredentials {
    fn get(&self, name: &str, account: Option<&str>) -> BoxFuture<'_, Result<String>> {
        let lock = self.lock_for(name);
        let name = name.to_string();
        let account = account.map(String::from);
        Box::pin(async move {
            let _guard = lock.lock().await;
            self.inner.get(&name, account.as_deref()).await
        })
    }

    fn preflight(&self, graph_id: &str) -> BoxFuture<'_, Result<()>> {
        self.inner.preflight(graph_id)
    }
}
