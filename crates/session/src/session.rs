//! Per-user session records.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::SessionError;
use crate::kv::KvStore;
use crate::user::User;

/// Hash field recording when the session was first created.
pub const SIGN_IN_TIME_FIELD: &str = "sign_in_time";

/// A user session stored as a hash under the user's session key.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn KvStore>,
    key: String,
    user: User,
}

impl Session {
    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn set(&self, field: &str, value: &str) -> Result<(), SessionError> {
        self.store.hset(&self.key, field, value).await?;
        Ok(())
    }

    pub async fn get(&self, field: &str) -> Result<Option<String>, SessionError> {
        Ok(self.store.hget(&self.key, field).await?)
    }

    pub async fn destroy(&self) -> Result<(), SessionError> {
        self.store
            .del(&self.key)
            .await
            .map_err(|e| SessionError::Destroy(e.to_string()))?;
        debug!(session_key = %self.key, "session destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("user", &self.user)
            .finish()
    }
}

/// Builds sessions with atomic create-if-absent semantics.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Create the session for `user`, or return the existing one.
    ///
    /// The boolean is true when the session was newly created. An existing
    /// session is still usable; callers decide whether to log the reuse.
    pub async fn build(&self, user: &User) -> Result<(Session, bool), SessionError> {
        let key = user.session_key();
        let fields = vec![(SIGN_IN_TIME_FIELD.to_string(), Utc::now().to_rfc3339())];

        let created = self
            .store
            .create_hash(&key, &fields)
            .await
            .map_err(|e| SessionError::Create(e.to_string()))?;

        let session = Session {
            store: self.store.clone(),
            key,
            user: user.clone(),
        };
        Ok((session, created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::user::Device;

    fn user() -> User {
        User {
            biz_id: 1,
            user_id: 42,
            device: Device::Mobile,
            auto_close: false,
        }
    }

    #[tokio::test]
    async fn build_creates_then_reuses() {
        let store = SessionStore::new(Arc::new(MemoryStore::new()));

        let (session, is_new) = store.build(&user()).await.unwrap();
        assert!(is_new);
        assert!(session.get(SIGN_IN_TIME_FIELD).await.unwrap().is_some());

        let (_again, is_new) = store.build(&user()).await.unwrap();
        assert!(!is_new);
    }

    #[tokio::test]
    async fn set_get_destroy() {
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        let (session, _) = store.build(&user()).await.unwrap();

        session.set("last_seen", "somewhere").await.unwrap();
        assert_eq!(
            session.get("last_seen").await.unwrap().as_deref(),
            Some("somewhere")
        );

        session.destroy().await.unwrap();
        assert!(session.get("last_seen").await.unwrap().is_none());

        // A new build succeeds after destroy.
        let (_, is_new) = store.build(&user()).await.unwrap();
        assert!(is_new);
    }
}
