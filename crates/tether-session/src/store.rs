//! Durable holder of the current session.
//!
//! [`TokenStore`] is the only writer of the session record. Local writes
//! and changes observed from other processes are both published as
//! [`SessionChange`] events so subscribers never poll storage themselves.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::{SESSION_KEY, SharedStorage};
use crate::token::AuthSession;

/// Capacity of the change broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written through this store.
    Local,
    /// Written by another process sharing the storage.
    External,
}

/// A change to the stored session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    Saved {
        session: AuthSession,
        origin: ChangeOrigin,
    },
    Cleared {
        origin: ChangeOrigin,
    },
}

impl SessionChange {
    /// Origin of the change.
    pub fn origin(&self) -> ChangeOrigin {
        match self {
            SessionChange::Saved { origin, .. } | SessionChange::Cleared { origin } => *origin,
        }
    }
}

struct StoreInner {
    storage: SharedStorage,
    /// In-memory copy; swapped in a single assignment.
    current: RwLock<Option<AuthSession>>,
    /// Raw value last written or observed, to tell our own writes apart.
    last_raw: Mutex<Option<String>>,
    events: broadcast::Sender<SessionChange>,
}

/// Durable key/value holder for the current [`AuthSession`].
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("has_session", &self.inner.current.read().is_some())
            .finish()
    }
}

impl TokenStore {
    /// Open the store, loading any session already persisted.
    pub fn new(storage: SharedStorage) -> Self {
        let raw = match storage.get(SESSION_KEY) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Could not read stored session, starting logged out");
                None
            }
        };
        let current = raw.as_deref().and_then(decode);
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(StoreInner {
                storage,
                current: RwLock::new(current),
                last_raw: Mutex::new(raw),
                events,
            }),
        }
    }

    /// Persist a session, replacing the previous one.
    pub fn save(&self, session: &AuthSession) -> Result<()> {
        let raw = serde_json::to_string(session)?;
        self.inner.storage.set(SESSION_KEY, &raw)?;

        *self.inner.last_raw.lock() = Some(raw);
        *self.inner.current.write() = Some(session.clone());

        debug!(expires_at = %session.expires_at, "Session saved");
        let _ = self.inner.events.send(SessionChange::Saved {
            session: session.clone(),
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }

    /// The current session, if any.
    pub fn load(&self) -> Option<AuthSession> {
        self.inner.current.read().clone()
    }

    /// The current bearer token, if any.
    pub fn token(&self) -> Option<String> {
        self.inner.current.read().as_ref().map(|s| s.token.clone())
    }

    /// Remove the session.
    ///
    /// The in-memory copy is dropped even if the durable removal fails, so
    /// this process never keeps using a session it tried to end.
    pub fn clear(&self) -> Result<()> {
        let had_session = self.inner.current.write().take().is_some();
        *self.inner.last_raw.lock() = None;
        let result = self.inner.storage.remove(SESSION_KEY);

        if had_session {
            info!("Session cleared");
            let _ = self.inner.events.send(SessionChange::Cleared {
                origin: ChangeOrigin::Local,
            });
        }
        result
    }

    /// Subscribe to session changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.inner.events.subscribe()
    }

    /// Re-read storage after another process may have written it.
    ///
    /// Publishes an [`ChangeOrigin::External`] event when the stored value
    /// differs from what this store last wrote or saw. Returns the change,
    /// if there was one.
    pub fn reload_external(&self) -> Result<Option<SessionChange>> {
        let raw = self.inner.storage.get(SESSION_KEY)?;

        {
            let mut last = self.inner.last_raw.lock();
            if *last == raw {
                return Ok(None);
            }
            last.clone_from(&raw);
        }

        let session = raw.as_deref().and_then(decode);
        let change = match session {
            Some(session) => {
                info!(expires_at = %session.expires_at, "Session replaced by another process");
                *self.inner.current.write() = Some(session.clone());
                SessionChange::Saved {
                    session,
                    origin: ChangeOrigin::External,
                }
            }
            None => {
                let had_session = self.inner.current.write().take().is_some();
                if !had_session {
                    return Ok(None);
                }
                info!("Session cleared by another process");
                SessionChange::Cleared {
                    origin: ChangeOrigin::External,
                }
            }
        };

        let _ = self.inner.events.send(change.clone());
        Ok(Some(change))
    }
}

fn decode(raw: &str) -> Option<AuthSession> {
    match serde_json::from_str::<AuthSession>(raw) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed stored session");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::token::UserRecord;
    use chrono::{Duration, Utc};

    fn session(token: &str) -> AuthSession {
        AuthSession {
            user: UserRecord {
                username: Some("ada".to_string()),
                ..Default::default()
            },
            token: token.to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_save_load_clear() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let store = TokenStore::new(storage.clone());
        assert!(store.load().is_none());

        store.save(&session("t1")).unwrap();
        assert_eq!(store.token().as_deref(), Some("t1"));
        assert!(storage.get(SESSION_KEY).unwrap().is_some());

        store.clear().unwrap();
        assert!(store.load().is_none());
        assert!(storage.get(SESSION_KEY).unwrap().is_none());
    }

    #[test]
    fn test_loads_persisted_session_on_open() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        TokenStore::new(storage.clone()).save(&session("t1")).unwrap();

        let reopened = TokenStore::new(storage);
        assert_eq!(reopened.token().as_deref(), Some("t1"));
    }

    #[test]
    fn test_malformed_record_loads_as_logged_out() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        storage.set(SESSION_KEY, "{not json").unwrap();

        let store = TokenStore::new(storage);
        assert!(store.load().is_none());
    }

    #[tokio::test]
    async fn test_local_changes_are_published() {
        let store = TokenStore::new(Arc::new(MemoryStorage::new()));
        let mut rx = store.subscribe();

        store.save(&session("t1")).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, SessionChange::Saved { origin: ChangeOrigin::Local, .. }));
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second,
            SessionChange::Cleared {
                origin: ChangeOrigin::Local
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reload_external_ignores_own_writes() {
        let store = TokenStore::new(Arc::new(MemoryStorage::new()));
        store.save(&session("t1")).unwrap();
        assert!(store.reload_external().unwrap().is_none());
    }

    #[test]
    fn test_reload_external_adopts_other_writer() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let ours = TokenStore::new(storage.clone());
        let theirs = TokenStore::new(storage);

        ours.save(&session("t1")).unwrap();
        theirs.save(&session("t2")).unwrap();

        let change = ours.reload_external().unwrap().unwrap();
        assert_eq!(change.origin(), ChangeOrigin::External);
        assert_eq!(ours.token().as_deref(), Some("t2"));

        theirs.clear().unwrap();
        let change = ours.reload_external().unwrap().unwrap();
        assert_eq!(
            change,
            SessionChange::Cleared {
                origin: ChangeOrigin::External
            }
        );
        assert!(ours.load().is_none());
    }
}
