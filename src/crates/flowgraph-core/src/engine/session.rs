//! Per-session execution locks
//!
//! Two executions never write the same session's state at once. Each session id maps to a
//! fair (FIFO) async mutex; a request either waits its turn or is rejected, depending on
//! [`SessionPolicy`]. Map entries are removed once nobody holds or awaits them.

use crate::error::{GraphError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// What to do with a request for a session that is already executing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Wait until the running execution finishes
    #[default]
    Queue,
    /// Fail with [`GraphError::SessionBusy`]
    Reject,
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Debug, Default)]
pub(crate) struct SessionLocks {
    locks: Arc<LockMap>,
}

impl SessionLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn acquire(&self, session_id: &str, policy: SessionPolicy) -> Result<SessionGuard> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        // Registered before waiting so a request cancelled in the queue still prunes its entry
        let entry = LockEntry {
            locks: Arc::clone(&self.locks),
            session_id: session_id.to_string(),
            lock: Some(Arc::clone(&lock)),
        };

        let guard = match policy {
            SessionPolicy::Queue => lock.lock_owned().await,
            SessionPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| GraphError::SessionBusy(session_id.to_string()))?,
        };

        Ok(SessionGuard {
            _guard: guard,
            _entry: entry,
        })
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

/// A request's claim on a session's map entry
struct LockEntry {
    locks: Arc<LockMap>,
    session_id: String,
    lock: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl Drop for LockEntry {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        self.lock.take();
        // Only the map's own reference left: nobody holds or waits on this session.
        if locks
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.session_id);
        }
    }
}

/// Held for the duration of one execution
///
/// Fields drop in order: the session is released before its entry is pruned.
pub(crate) struct SessionGuard {
    _guard: OwnedMutexGuard<()>,
    _entry: LockEntry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reject_while_busy() {
        let locks = SessionLocks::new();
        let first = locks.acquire("s1", SessionPolicy::Reject).await.unwrap();

        assert!(matches!(
            locks.acquire("s1", SessionPolicy::Reject).await,
            Err(GraphError::SessionBusy(id)) if id == "s1"
        ));
        assert!(locks.acquire("s2", SessionPolicy::Reject).await.is_ok());

        drop(first);
        assert!(locks.acquire("s1", SessionPolicy::Reject).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_waits_for_release() {
        let locks = Arc::new(SessionLocks::new());
        let first = locks.acquire("s1", SessionPolicy::Queue).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("s1", SessionPolicy::Queue).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_entries_cleaned_up() {
        let locks = SessionLocks::new();
        {
            let _a = locks.acquire("a", SessionPolicy::Queue).await.unwrap();
            let _b = locks.acquire("b", SessionPolicy::Queue).await.unwrap();
            assert_eq!(locks.tracked(), 2);
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_cleaned_up() {
        let locks = SessionLocks::new();

        // Waiter gives up before the holder is done
        let first = locks.acquire("s1", SessionPolicy::Queue).await.unwrap();
        let mut waiting = Box::pin(locks.acquire("s1", SessionPolicy::Queue));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut waiting).await.is_err());
        drop(waiting);
        drop(first);
        assert_eq!(locks.tracked(), 0);

        // Holder finishes first, then the queued waiter is cancelled
        let first = locks.acquire("s1", SessionPolicy::Queue).await.unwrap();
        let mut waiting = Box::pin(locks.acquire("s1", SessionPolicy::Queue));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut waiting).await.is_err());
        drop(first);
        drop(waiting);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_rejected_request_cleaned_up() {
        let locks = SessionLocks::new();
        let first = locks.acquire("s1", SessionPolicy::Reject).await.unwrap();
        assert!(locks.acquire("s1", SessionPolicy::Reject).await.is_err());
        drop(first);
        assert_eq!(locks.tracked(), 0);
    }
}
