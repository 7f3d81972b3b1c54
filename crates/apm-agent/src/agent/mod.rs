//! Agent lifecycle.
//!
//! [`Agent`] builds the shared aggregators and every component that feeds
//! them, then runs two background tasks once started:
//!
//! - the harvest scheduler, which drains metrics and supportability counters
//!   into a report every harvest interval and performs a final harvest on
//!   shutdown;
//! - the reaper, which finalizes transactions that outlived the reap timeout.

use std::sync::Arc;
use std::time::Duration;

use apm_metrics::double_buffered_aggregator::DoubleBufferedAggregator;
use apm_metrics::harvest::{
    HarvestOutcome, HarvestScheduler, Harvester, HarvesterConfig, Reporter,
};
use apm_metrics::supportability::{ApiMethod, ApiSupportabilityCounters};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::AgentApi;
use crate::config::Config;
use crate::custom_event::CustomEventBuffer;
use crate::distributed_trace::DistributedTraceService;
use crate::instrumentation::InstrumentationEvents;
use crate::logger;
use crate::transaction::{TransactionKind, TransactionRegistry};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("Startup error: {0}")]
    StartupError(String),
}

/// Cloneable handle used to request shutdown from elsewhere.
#[derive(Clone)]
pub struct AgentHandle {
    shutdown_token: CancellationToken,
}

impl AgentHandle {
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}

pub struct Agent {
    config: Arc<Config>,
    metrics: Arc<DoubleBufferedAggregator>,
    supportability: Arc<ApiSupportabilityCounters>,
    registry: Arc<TransactionRegistry>,
    distributed_trace: Arc<DistributedTraceService>,
    events: Arc<InstrumentationEvents>,
    custom_events: Arc<CustomEventBuffer>,
    api: AgentApi,
    harvester: Option<Arc<Harvester>>,
    shutdown_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self, AgentError> {
        info!("Initializing APM agent for {}", config.app_name);

        let config = Arc::new(config);
        let metrics = Arc::new(
            DoubleBufferedAggregator::new(config.max_metric_contexts)
                .map_err(|e| AgentError::InitError(e.to_string()))?,
        );
        let supportability = Arc::new(ApiSupportabilityCounters::new(
            config.supportability_metrics_enabled,
        ));
        let registry = Arc::new(TransactionRegistry::new(Arc::clone(&metrics)));
        let distributed_trace = Arc::new(DistributedTraceService::new(
            &config,
            Arc::clone(&metrics),
        ));
        let events = Arc::new(InstrumentationEvents::new(
            Arc::clone(&registry),
            TransactionKind::Web,
        ));
        let custom_events = Arc::new(CustomEventBuffer::default());
        let api = AgentApi::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&distributed_trace),
            Arc::clone(&metrics),
            Arc::clone(&supportability),
            Arc::clone(&custom_events),
        );

        if config.distributed_tracing_enabled && config.trusted_account_key.is_empty() {
            warn!("Distributed tracing is enabled without a trusted account key, inbound payloads will be rejected");
        }

        Ok(Self {
            config,
            metrics,
            supportability,
            registry,
            distributed_trace,
            events,
            custom_events,
            api,
            harvester: None,
            shutdown_token: CancellationToken::new(),
            task_handles: Vec::new(),
        })
    }

    /// Installs the agent's log formatter as the global subscriber, filtered
    /// at the configured log level. Call once at startup; fails when the host
    /// already installed a subscriber.
    pub fn init_logging(&self) -> Result<(), AgentError> {
        logger::init(self.config.log_level).map_err(|e| AgentError::InitError(e.to_string()))
    }

    /// Starts the harvest and reaper tasks. Must be called from within a
    /// tokio runtime.
    pub fn start(&mut self, reporter: Arc<dyn Reporter>) -> Result<(), AgentError> {
        self.supportability.increment(ApiMethod::StartAgent);

        if self.harvester.is_some() {
            return Err(AgentError::StartupError(
                "Agent is already started. Cannot start again.".to_string(),
            ));
        }
        if self.shutdown_token.is_cancelled() {
            return Err(AgentError::StartupError(
                "Agent has been shut down. Cannot start again.".to_string(),
            ));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AgentError::StartupError(
                "Agent must be started from within a tokio runtime".to_string(),
            ));
        }

        let harvester = Arc::new(Harvester::new(
            Arc::clone(&self.metrics),
            Arc::clone(&self.supportability),
            reporter,
            HarvesterConfig {
                max_retained_cycles: self.config.harvest_max_retained_cycles,
            },
        ));
        let scheduler = HarvestScheduler::new(Arc::clone(&harvester), self.config.harvest_interval);
        info!(
            "Starting harvest every {}s",
            scheduler.period().as_secs_f64()
        );
        self.task_handles
            .push(tokio::spawn(scheduler.run(self.shutdown_token.clone())));
        self.task_handles.push(self.spawn_reaper());
        self.harvester = Some(harvester);

        Ok(())
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let cancel = self.shutdown_token.clone();
        let max_age = self.config.transaction_reap_timeout;
        let period = (max_age / 2).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // discard first tick, which is instantaneous

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = registry.reap_abandoned(max_age);
                        let pruned = events.prune_stale();
                        if reaped > 0 || pruned > 0 {
                            debug!("Reaper finalized {reaped} transactions and cleared {pruned} instrumented contexts");
                        }
                    }
                    () = cancel.cancelled() => {
                        debug!("Transaction reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Runs one harvest immediately. `None` until the agent is started.
    pub async fn harvest_now(&self) -> Option<HarvestOutcome> {
        match &self.harvester {
            Some(harvester) => Some(harvester.harvest().await),
            None => None,
        }
    }

    /// Stops the background tasks. The harvest scheduler performs a final
    /// harvest before it exits.
    pub async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");
        self.shutdown_token.cancel();

        let shutdown_deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        let handles = std::mem::take(&mut self.task_handles);
        for (idx, handle) in handles.into_iter().enumerate() {
            let remaining =
                shutdown_deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!("Shutdown timeout exceeded, aborting remaining tasks");
                handle.abort();
                continue;
            }
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => debug!("Task {idx} completed successfully"),
                Ok(Err(e)) => error!("Task {idx} failed: {e}"),
                Err(_) => warn!("Task {idx} timed out, aborting"),
            }
        }

        let active = self.registry.active_count();
        if active > 0 {
            debug!("{active} transactions were still active at shutdown");
        }
        info!("Agent shutdown complete");
    }

    #[must_use]
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shutdown_token: self.shutdown_token.clone(),
        }
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.harvester.is_some()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn api(&self) -> &AgentApi {
        &self.api
    }

    #[must_use]
    pub fn events(&self) -> &Arc<InstrumentationEvents> {
        &self.events
    }

    /// Custom events recorded through the API, awaiting collection.
    #[must_use]
    pub fn custom_events(&self) -> &Arc<CustomEventBuffer> {
        &self.custom_events
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn distributed_trace(&self) -> &Arc<DistributedTraceService> {
        &self.distributed_trace
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<DoubleBufferedAggregator> {
        &self.metrics
    }

    #[must_use]
    pub fn supportability(&self) -> &Arc<ApiSupportabilityCounters> {
        &self.supportability
    }
}
