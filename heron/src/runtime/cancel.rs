use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::job::{JobError, JobId};

/// Cooperative cancellation flag. Used for runtime shutdown and for
/// per-job cancel requests.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelTokenInner>,
}

#[derive(Debug, Default)]
struct CancelTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let mut notified = pin!(self.inner.notify.notified());
        // register before checking the flag so a concurrent cancel is not lost
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Ignored cancel requests kept by default; older entries are dropped first.
pub const INEFFECTIVE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct IneffectiveLedger {
    order: VecDeque<JobId>,
    entries: HashMap<JobId, JobError>,
}

/// Tracks cancel tokens for in-flight jobs and the cancel requests their
/// handlers ignored.
#[derive(Debug)]
pub struct CancelRegistry {
    inflight: Mutex<HashMap<JobId, CancelToken>>,
    ineffective: Mutex<IneffectiveLedger>,
    capacity: usize,
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::with_capacity(INEFFECTIVE_CAPACITY)
    }
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry remembering at most `capacity` ignored cancel requests.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            ineffective: Mutex::new(IneffectiveLedger::default()),
            capacity: capacity.max(1),
        }
    }

    /// Register a job that is about to run and return its token.
    pub fn register(&self, id: JobId) -> CancelToken {
        self.inflight.lock().entry(id).or_default().clone()
    }

    pub fn remove(&self, id: JobId) -> Option<CancelToken> {
        self.inflight.lock().remove(&id)
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.inflight.lock().contains_key(&id)
    }

    /// Signal the job's token. Returns `false` when the job is not running here.
    pub fn request(&self, id: JobId) -> bool {
        match self.inflight.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn was_requested(&self, id: JobId) -> bool {
        self.inflight
            .lock()
            .get(&id)
            .is_some_and(CancelToken::is_cancelled)
    }

    pub fn record_ineffective(&self, id: JobId, error: JobError) {
        let mut ledger = self.ineffective.lock();
        if ledger.entries.insert(id, error).is_none() {
            ledger.order.push_back(id);
        }
        while ledger.order.len() > self.capacity {
            if let Some(oldest) = ledger.order.pop_front() {
                ledger.entries.remove(&oldest);
            }
        }
    }

    /// The most recent cancel requests that arrived while the job ran and
    /// were not honoured.
    pub fn ineffective(&self) -> HashMap<JobId, JobError> {
        self.ineffective.lock().entries.clone()
    }

    pub fn running(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_registry_tracks_requests() {
        let registry = CancelRegistry::new();
        let token = registry.register(JobId(1));
        assert!(registry.is_running(JobId(1)));
        assert!(!registry.request(JobId(2)));
        assert!(registry.request(JobId(1)));
        assert!(token.is_cancelled());
        assert!(registry.was_requested(JobId(1)));

        registry.record_ineffective(JobId(1), JobError::new(ErrorCode::Cancelled, "ignored"));
        registry.remove(JobId(1));
        assert_eq!(registry.running(), 0);
        assert!(registry.ineffective().contains_key(&JobId(1)));
    }

    #[test]
    fn test_ineffective_ledger_drops_oldest() {
        let registry = CancelRegistry::with_capacity(3);
        for id in 1..=5 {
            registry.record_ineffective(JobId(id), JobError::new(ErrorCode::Cancelled, "ignored"));
        }
        // re-recording an entry does not grow the ledger
        registry.record_ineffective(JobId(5), JobError::new(ErrorCode::Cancelled, "again"));

        let ledger = registry.ineffective();
        assert_eq!(ledger.len(), 3);
        assert!(!ledger.contains_key(&JobId(1)));
        assert!(!ledger.contains_key(&JobId(2)));
        assert_eq!(ledger[&JobId(5)].message, "again");
    }
}
