//! User activity tracking and idle expiry.
//!
//! The UI shell forwards interaction events through [`ActivityTracker::record`]
//! and visibility changes through [`ActivityTracker::set_visible`]. While the
//! application is visible a heartbeat keeps the record fresh, so an open but
//! untouched window does not expire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::clock::SharedClock;
use crate::config::SessionSettings;
use crate::storage::{ACTIVITY_KEY, SharedStorage};

/// Interaction events that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    Pointer,
    Keyboard,
    Touch,
    Focus,
    Scroll,
}

struct ActivityInner {
    storage: SharedStorage,
    clock: SharedClock,
    idle_timeout: Duration,
    throttle: Duration,
    heartbeat_interval: Duration,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    last_persisted: Mutex<Option<DateTime<Utc>>>,
    visible: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ActivityInner {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get_mut().take() {
            handle.abort();
        }
    }
}

/// Records the last user interaction and answers "idle too long?".
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<ActivityInner>,
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("last_activity", &*self.inner.last_activity.lock())
            .field("visible", &self.is_visible())
            .finish()
    }
}

impl ActivityTracker {
    /// Create a tracker, adopting any persisted timestamp.
    ///
    /// Starts out visible with no heartbeat running.
    pub fn new(storage: SharedStorage, clock: SharedClock, settings: &SessionSettings) -> Self {
        let persisted = read_persisted(&storage);
        Self {
            inner: Arc::new(ActivityInner {
                storage,
                clock,
                idle_timeout: settings.idle_timeout,
                throttle: settings.touch_throttle,
                heartbeat_interval: settings.heartbeat_interval,
                last_activity: Mutex::new(persisted),
                last_persisted: Mutex::new(persisted),
                visible: AtomicBool::new(true),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Record activity now.
    ///
    /// Cheap enough to call on every input event: the durable write only
    /// happens once per throttle window.
    pub fn touch(&self) {
        let now = self.inner.clock.now();
        *self.inner.last_activity.lock() = Some(now);

        let due = {
            let mut persisted = self.inner.last_persisted.lock();
            let due = match *persisted {
                None => true,
                Some(at) => (now - at).to_std().unwrap_or_default() >= self.inner.throttle,
            };
            if due {
                *persisted = Some(now);
            }
            due
        };

        if due {
            trace!(at = %now, "Persisting activity");
            if let Err(e) = self
                .inner
                .storage
                .set(ACTIVITY_KEY, &now.timestamp_millis().to_string())
            {
                warn!(error = %e, "Failed to persist activity timestamp");
            }
        }
    }

    /// Whether the user has been idle for at least the idle timeout.
    ///
    /// No record means no session to expire, so that reads as active.
    /// Before answering `true`, storage is re-read in case another process
    /// saw more recent activity.
    pub fn is_idle_expired(&self) -> bool {
        if !self.idle_past_threshold() {
            return false;
        }
        self.reload_external();
        self.idle_past_threshold()
    }

    fn idle_past_threshold(&self) -> bool {
        match *self.inner.last_activity.lock() {
            None => false,
            Some(at) => {
                let idle = (self.inner.clock.now() - at).to_std().unwrap_or_default();
                idle >= self.inner.idle_timeout
            }
        }
    }

    /// Timestamp of the last recorded activity.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_activity.lock()
    }

    /// Time left before idle expiry, if there is a record.
    pub fn idle_remaining(&self) -> Option<Duration> {
        self.last_activity().map(|at| {
            let idle = (self.inner.clock.now() - at).to_std().unwrap_or_default();
            self.inner.idle_timeout.saturating_sub(idle)
        })
    }

    /// Record a UI interaction event.
    pub fn record(&self, event: ActivityEvent) {
        trace!(?event, "Activity event");
        self.touch();
    }

    /// Report a visibility change. Becoming visible counts as activity.
    pub fn set_visible(&self, visible: bool) {
        let was_visible = self.inner.visible.swap(visible, Ordering::SeqCst);
        if visible && !was_visible {
            debug!("Became visible");
            self.touch();
        }
    }

    /// Whether the application is currently visible.
    pub fn is_visible(&self) -> bool {
        self.inner.visible.load(Ordering::SeqCst)
    }

    /// Start the heartbeat, replacing any running one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_heartbeat(&self) {
        let weak: Weak<ActivityInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let tracker = ActivityTracker { inner };
                if tracker.is_visible() {
                    trace!("Heartbeat");
                    tracker.touch();
                }
            }
        });

        if let Some(previous) = self.inner.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the heartbeat, if running.
    pub fn stop_heartbeat(&self) {
        if let Some(handle) = self.inner.heartbeat.lock().take() {
            handle.abort();
        }
    }

    /// Whether a heartbeat task is running.
    pub fn heartbeat_running(&self) -> bool {
        self.inner
            .heartbeat
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Clear the session-scoped activity record, in memory and on disk.
    pub fn clear(&self) {
        self.forget();
        if let Err(e) = self.inner.storage.remove(ACTIVITY_KEY) {
            warn!(error = %e, "Failed to remove activity timestamp");
        }
    }

    /// Drop the in-memory record only; storage is left untouched.
    pub fn forget(&self) {
        *self.inner.last_activity.lock() = None;
        *self.inner.last_persisted.lock() = None;
    }

    /// Adopt a newer timestamp written by another process.
    ///
    /// Returns true when the in-memory record moved forward.
    pub fn reload_external(&self) -> bool {
        let Some(stored) = read_persisted(&self.inner.storage) else {
            return false;
        };

        let mut last = self.inner.last_activity.lock();
        if last.is_some_and(|at| at >= stored) {
            return false;
        }
        *last = Some(stored);
        *self.inner.last_persisted.lock() = Some(stored);
        true
    }
}

fn read_persisted(storage: &SharedStorage) -> Option<DateTime<Utc>> {
    let raw = match storage.get(ACTIVITY_KEY) {
        Ok(raw) => raw?,
        Err(e) => {
            warn!(error = %e, "Failed to read activity timestamp");
            return None;
        }
    };
    let millis = raw.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}
