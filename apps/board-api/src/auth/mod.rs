//! Identity verification collaborator.

pub mod middleware;
pub mod tokens;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::kv::KeyValueStore;
use crate::error::StoreError;

/// A verified user identity, as vouched for by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
}

/// Maps a bearer credential to a verified identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(None)` means the credential is unknown or expired.
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>, StoreError>;
}

/// Authenticator backed by opaque session tokens in a key-value store.
pub struct KvAuthenticator {
    kv: Arc<dyn KeyValueStore>,
}

impl KvAuthenticator {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Mint and store a fresh session token for `identity`.
    pub async fn issue_session(&self, identity: &Identity) -> Result<String, StoreError> {
        let token = tokens::generate_session_token();
        tokens::store_session(self.kv.as_ref(), &token, identity).await?;
        Ok(token)
    }

    pub async fn revoke_session(&self, token: &str) -> Result<(), StoreError> {
        tokens::revoke_session(self.kv.as_ref(), token).await
    }
}

#[async_trait]
impl Authenticator for KvAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        tokens::lookup_session(self.kv.as_ref(), token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryStore;

    #[tokio::test]
    async fn issued_session_authenticates() {
        let auth = KvAuthenticator::new(Arc::new(MemoryStore::new()));
        let identity = Identity {
            user_id: "usr_1".into(),
            username: "ada".into(),
            display_name: "Ada".into(),
        };
        let token = auth.issue_session(&identity).await.unwrap();
        assert!(token.starts_with("ses_"));
        assert_eq!(auth.authenticate(&token).await.unwrap(), Some(identity));
        assert_eq!(auth.authenticate("ses_bogus").await.unwrap(), None);

        auth.revoke_session(&token).await.unwrap();
        assert_eq!(auth.authenticate(&token).await.unwrap(), None);
    }
}
