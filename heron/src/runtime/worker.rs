use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Per-pool execution counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub name: String,
    /// Jobs waiting in the pool at the last dispatcher pass.
    pub queued: usize,
    /// Jobs handed to the pool since start.
    pub received: u64,
    pub completed: u64,
    pub retries: u64,
    pub failed: u64,
    /// Job currently running in the pool, if any.
    pub running_job: Option<JobId>,
    /// When `running_job` started.
    pub running_since: Option<DateTime<Utc>>,
    /// Total execution time in milliseconds.
    pub running_time_ms: i64,
}

/// How an attempt ended, for stats purposes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttemptResult {
    Completed,
    Retried,
    Failed,
    Cancelled,
}

/// Shared stats for all pools.
#[derive(Debug, Default)]
pub struct WorkerStatsRegistry {
    pools: Mutex<BTreeMap<String, WorkerStats>>,
}

impl WorkerStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_pool<R>(&self, pool: &str, f: impl FnOnce(&mut WorkerStats) -> R) -> R {
        let mut pools = self.pools.lock();
        let stats = pools.entry(pool.to_string()).or_insert_with(|| WorkerStats {
            name: pool.to_string(),
            ..WorkerStats::default()
        });
        f(stats)
    }

    pub fn set_queued(&self, pool: &str, queued: usize) {
        self.with_pool(pool, |s| s.queued = queued);
    }

    pub fn record_start(&self, pool: &str, job_id: JobId, at: DateTime<Utc>) {
        self.with_pool(pool, |s| {
            s.received += 1;
            s.running_job = Some(job_id);
            s.running_since = Some(at);
        });
    }

    pub fn record_finish(&self, pool: &str, job_id: JobId, result: AttemptResult, duration_ms: i64) {
        self.with_pool(pool, |s| {
            match result {
                AttemptResult::Completed => s.completed += 1,
                AttemptResult::Retried => s.retries += 1,
                AttemptResult::Failed | AttemptResult::Cancelled => s.failed += 1,
            }
            s.running_time_ms += duration_ms.max(0);
            if s.running_job == Some(job_id) {
                s.running_job = None;
                s.running_since = None;
            }
        });
    }

    pub fn snapshot(&self) -> Vec<WorkerStats> {
        self.pools.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate_per_pool() {
        let stats = WorkerStatsRegistry::new();
        let now = Utc::now();
        stats.record_start("mail", JobId(1), now);
        stats.record_finish("mail", JobId(1), AttemptResult::Retried, 10);
        stats.record_start("mail", JobId(1), now);
        stats.record_finish("mail", JobId(1), AttemptResult::Completed, 15);
        stats.record_start("default", JobId(2), now);
        stats.set_queued("default", 3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 2);
        let default = &snapshot[0];
        assert_eq!(default.name, "default");
        assert_eq!(default.running_job, Some(JobId(2)));
        assert_eq!(default.queued, 3);
        let mail = &snapshot[1];
        assert_eq!((mail.received, mail.completed, mail.retries), (2, 1, 1));
        assert_eq!(mail.running_time_ms, 25);
        assert_eq!(mail.running_job, None);
    }
}
