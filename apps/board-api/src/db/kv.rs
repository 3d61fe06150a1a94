use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Abstraction over a key-value store used for session tokens.
///
/// The bundled implementation is an in-process map with TTL expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single process / tests)
// ---------------------------------------------------------------------------

pub struct MemoryStore {
    data: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.data
            .lock()
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut data = self.data.lock();
        let expired = match data.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                return Ok(Some(value.clone()))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            data.remove(key);
        }
        Ok(None)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }
}
