//! Cross-process change detection for [`FileStorage`].
//!
//! Another process sharing the storage directory can log in, refresh or
//! log out at any time. The watcher turns those file writes into
//! [`TokenStore::reload_external`] and [`ActivityTracker::reload_external`]
//! calls, so the rest of the session layer only ever reacts to
//! [`SessionChange`](crate::SessionChange) events.

use std::path::PathBuf;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{Debouncer, new_debouncer};
use tracing::{debug, error, info, warn};

use crate::activity::ActivityTracker;
use crate::error::{Error, Result};
use crate::storage::{ACTIVITY_KEY, FileStorage, SESSION_KEY};
use crate::store::TokenStore;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Keeps a storage directory under watch until dropped.
pub struct StorageWatcher {
    dir: PathBuf,
    // Dropping the debouncer closes the event channel and ends the thread.
    _debouncer: Debouncer<RecommendedWatcher>,
    handle: std::thread::JoinHandle<()>,
}

impl std::fmt::Debug for StorageWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWatcher")
            .field("dir", &self.dir)
            .field("running", &self.is_running())
            .finish()
    }
}

impl StorageWatcher {
    /// Start watching `storage`'s directory.
    pub fn start(
        storage: &FileStorage,
        store: TokenStore,
        activity: ActivityTracker,
        debounce: Duration,
    ) -> Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(debounce, tx)
            .map_err(|e| Error::Storage(format!("Failed to create watcher: {e}")))?;

        let dir = storage.dir().to_path_buf();
        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Storage(format!("Failed to watch {}: {}", dir.display(), e)))?;

        info!(dir = %dir.display(), debounce_ms = debounce.as_millis() as u64, "Watching session storage");

        let storage = storage.clone();
        let handle = std::thread::spawn(move || {
            while let Ok(result) = rx.recv() {
                match result {
                    Ok(events) => {
                        let mut session_touched = false;
                        let mut activity_touched = false;
                        for event in events {
                            match storage.key_for(&event.path).as_deref() {
                                Some(SESSION_KEY) => session_touched = true,
                                Some(ACTIVITY_KEY) => activity_touched = true,
                                _ => {}
                            }
                        }

                        if session_touched {
                            debug!("Session file changed");
                            if let Err(e) = store.reload_external() {
                                warn!(error = %e, "Failed to reload session");
                            }
                        }
                        if activity_touched && activity.reload_external() {
                            debug!("Adopted activity from another process");
                        }
                    }
                    Err(e) => {
                        error!("Storage watcher error: {:?}", e);
                    }
                }
            }
            debug!("Storage watcher thread exiting");
        });

        Ok(Self {
            dir,
            _debouncer: debouncer,
            handle,
        })
    }

    /// The watched directory.
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Whether the watcher thread is alive.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::config::SessionSettings;
    use crate::storage::SharedStorage;
    use crate::store::{ChangeOrigin, SessionChange};
    use crate::token::{AuthSession, UserRecord};
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_other_process_write_is_published() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).unwrap();
        let shared: SharedStorage = Arc::new(storage.clone());
        let clock: SharedClock = Arc::new(ManualClock::starting_now());

        let store = TokenStore::new(shared.clone());
        let activity = ActivityTracker::new(shared, clock, &SessionSettings::new());
        let mut rx = store.subscribe();
        let watcher = StorageWatcher::start(
            &storage,
            store.clone(),
            activity,
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(watcher.is_running());

        // A second process with its own store over the same directory.
        let other = TokenStore::new(Arc::new(FileStorage::open(tmp.path()).unwrap()));
        other
            .save(&AuthSession {
                user: UserRecord::default(),
                token: "from-elsewhere".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
            .unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change observed")
            .unwrap();
        assert_eq!(change.origin(), ChangeOrigin::External);
        assert!(matches!(change, SessionChange::Saved { .. }));
        assert_eq!(store.token().as_deref(), Some("from-elsewhere"));
    }

    #[test]
    fn test_watcher_stops_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).unwrap();
        let shared: SharedStorage = Arc::new(storage.clone());
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let store = TokenStore::new(shared.clone());
        let activity = ActivityTracker::new(shared.clone(), clock, &SessionSettings::new());

        let watcher =
            StorageWatcher::start(&storage, store, activity, DEFAULT_DEBOUNCE).unwrap();
        assert_eq!(watcher.dir(), storage.dir());
        drop(watcher);

        shared.set(SESSION_KEY, "{}").unwrap();
    }
}
