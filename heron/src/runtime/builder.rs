use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::budget::{Budget, BudgetConfig, InMemoryBudget};
use crate::config::JobsConfig;
use crate::cron::Materializer;
use crate::events::InProcEventBus;
use crate::persistence::InMemoryJobStore;
use crate::retry::RetryPolicy;
use crate::scheduler::{Dispatcher, DispatcherConfig};
use crate::store::JobStore;

use super::cancel::CancelRegistry;
use super::executor::WorkerExecutor;
use super::intake::JobIntake;
use super::registry::{CommandHandler, CommandRegistry, JobContext};
use super::supervisor::BackgroundJobs;
use super::worker::WorkerStatsRegistry;

/// Builder for [`BackgroundJobs`].
///
/// Everything except the handlers has a default: an in-memory store, an
/// in-process event bus and per-pool budgets derived from the config.
///
/// # Example
///
/// ```
/// use heron::{BackgroundJobsBuilder, JobsConfig};
///
/// let runtime = BackgroundJobsBuilder::new(JobsConfig::default())
///     .register_fn("Echo", |_ctx, payload| async move { Ok(Some(payload)) })
///     .build()
///     .unwrap();
/// # drop(runtime);
/// ```
pub struct BackgroundJobsBuilder {
    config: JobsConfig,
    store: Option<Arc<dyn JobStore>>,
    registry: CommandRegistry,
    events: Option<Arc<InProcEventBus>>,
    budget: Option<Arc<dyn Budget>>,
}

impl std::fmt::Debug for BackgroundJobsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundJobsBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("registry", &self.registry)
            .field("events_set", &self.events.is_some())
            .field("budget_set", &self.budget.is_some())
            .finish()
    }
}

impl Default for BackgroundJobsBuilder {
    fn default() -> Self {
        Self::new(JobsConfig::default())
    }
}

impl BackgroundJobsBuilder {
    pub fn new(config: JobsConfig) -> Self {
        Self {
            config,
            store: None,
            registry: CommandRegistry::new(),
            events: None,
            budget: None,
        }
    }

    pub fn with_config(mut self, config: JobsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Connect to Postgres using `config.persistence` and apply the schema.
    #[cfg(feature = "postgres")]
    pub async fn with_postgres(mut self) -> anyhow::Result<Self> {
        let persistence = self
            .config
            .persistence
            .clone()
            .ok_or_else(|| anyhow::anyhow!("persistence config is required for postgres"))?;
        let store = crate::persistence::PostgresJobStore::connect(&persistence).await?;
        store.migrate().await?;
        self.store = Some(Arc::new(store));
        Ok(self)
    }

    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn register(mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        self.registry.register(name, handler);
        self
    }

    pub fn register_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<serde_json::Value>>> + Send + 'static,
    {
        self.registry.register_fn(name, f);
        self
    }

    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_budget(mut self, budget: Arc<dyn Budget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<BackgroundJobs>> {
        let config = self.config;
        if config.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be greater than zero");
        }
        if config.default_timeout_secs == 0 {
            anyhow::bail!("default_timeout_secs must be greater than zero");
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(config.event_capacity)));
        let budget = self.budget.unwrap_or_else(|| {
            Arc::new(InMemoryBudget::new(BudgetConfig::from(&config.pools)))
        });
        let stats = Arc::new(WorkerStatsRegistry::new());

        let intake = Arc::new(JobIntake::new(
            store.clone(),
            events.clone(),
            config.default_retry_limit,
        ));
        let executor = Arc::new(WorkerExecutor::new(
            store.clone(),
            Arc::new(self.registry),
            events.clone(),
            RetryPolicy::new(config.retry.clone()),
            Arc::new(CancelRegistry::new()),
            stats.clone(),
            config.default_timeout_secs,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            budget,
            executor.clone(),
            events.clone(),
            stats.clone(),
            DispatcherConfig {
                tick_interval: Duration::from_millis(config.tick_interval_ms),
                max_backoff: Duration::from_millis(config.coordinator_max_backoff_ms),
                ..DispatcherConfig::default()
            },
        ));
        let materializer = Arc::new(Materializer::new(intake.clone()));

        Ok(Arc::new(BackgroundJobs::from_parts(
            config,
            store,
            events,
            intake,
            executor,
            dispatcher,
            materializer,
            stats,
        )))
    }
}
