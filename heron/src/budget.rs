use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::PoolConfig;
use crate::job::JobId;

/// A slot held by one running job in a worker pool.
///
/// Returned by [`Budget::try_acquire`]; must be handed back through
/// [`Budget::release`] once the job settles.
#[derive(Debug)]
pub struct PoolToken {
    /// Pool the slot belongs to.
    pub pool: String,
    /// Job occupying the slot.
    pub job_id: JobId,
    /// Timestamp when the slot was taken.
    pub acquired_at: DateTime<Utc>,
}

impl PoolToken {
    pub fn new(pool: impl Into<String>, job_id: JobId) -> Self {
        Self {
            pool: pool.into(),
            job_id,
            acquired_at: Utc::now(),
        }
    }
}

/// Concurrency limit per pool.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Per-pool limits
    limits: HashMap<String, usize>,
    /// Limit for pools not explicitly configured
    default_limit: usize,
}

impl BudgetConfig {
    pub fn new(limits: HashMap<String, usize>, default_limit: usize) -> Self {
        Self {
            limits,
            default_limit,
        }
    }

    pub fn with_default(default_limit: usize) -> Self {
        Self {
            limits: HashMap::new(),
            default_limit,
        }
    }

    pub fn with_limit(mut self, pool: impl Into<String>, limit: usize) -> Self {
        self.limits.insert(pool.into(), limit);
        self
    }

    pub fn limit(&self, pool: &str) -> usize {
        self.limits
            .get(pool)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::with_default(1)
    }
}

impl From<&PoolConfig> for BudgetConfig {
    fn from(config: &PoolConfig) -> Self {
        Self::new(config.overrides.clone(), config.default_max_concurrent)
    }
}

/// Bounds how many jobs of each pool may run at once.
#[async_trait]
pub trait Budget: Send + Sync {
    /// Take a slot for `job_id` in `pool`, or `None` when the pool is full.
    async fn try_acquire(
        &self,
        pool: &str,
        job_id: JobId,
    ) -> anyhow::Result<Option<Arc<PoolToken>>>;

    /// Return a slot to its pool.
    async fn release(&self, token: Arc<PoolToken>) -> anyhow::Result<()>;

    /// Returns (running, limit).
    async fn utilization(&self, pool: &str) -> anyhow::Result<(usize, usize)>;

    /// Free slots in `pool`.
    async fn available(&self, pool: &str) -> anyhow::Result<usize> {
        let (current, limit) = self.utilization(pool).await?;
        Ok(limit.saturating_sub(current))
    }

    async fn has_budget(&self, pool: &str) -> anyhow::Result<bool> {
        Ok(self.available(pool).await? > 0)
    }
}

/// Default in-memory implementation of [`Budget`].
pub struct InMemoryBudget {
    config: BudgetConfig,
    /// Per-pool counters
    counters: Arc<Mutex<HashMap<String, usize>>>,
}

impl std::fmt::Debug for InMemoryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryBudget");

        match self.counters.try_lock() {
            Ok(counters) => {
                debug.field("counters", &*counters);
            }
            Err(_) => {
                debug.field("counters", &"<locked>");
            }
        }

        debug.finish_non_exhaustive()
    }
}

impl InMemoryBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Budget for InMemoryBudget {
    async fn try_acquire(
        &self,
        pool: &str,
        job_id: JobId,
    ) -> anyhow::Result<Option<Arc<PoolToken>>> {
        let limit = self.config.limit(pool);
        let mut counters = self.counters.lock().await;
        let current = counters.entry(pool.to_string()).or_insert(0);

        if *current < limit {
            *current += 1;
            Ok(Some(Arc::new(PoolToken::new(pool, job_id))))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, token: Arc<PoolToken>) -> anyhow::Result<()> {
        let mut counters = self.counters.lock().await;
        if let Some(count) = counters.get_mut(&token.pool) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn utilization(&self, pool: &str) -> anyhow::Result<(usize, usize)> {
        let counters = self.counters.lock().await;
        let current = counters.get(pool).copied().unwrap_or(0);
        Ok((current, self.config.limit(pool)))
    }
}
