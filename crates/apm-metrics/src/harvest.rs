// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic harvest of aggregated metrics.
//!
//! A harvest moves through `Idle -> Harvesting -> Idle`. Only one harvest can
//! be in flight; a tick that fires while the previous cycle is still waiting
//! on the reporter is skipped and counted. When the reporter fails, the
//! cycle is kept and merged into the next report. At most
//! `max_retained_cycles` failed cycles are kept; beyond that the oldest are
//! dropped and the number of dropped records is counted.

use crate::constants::{
    DEFAULT_HARVEST_INTERVAL, DEFAULT_MAX_RETAINED_CYCLES, HARVEST_DROPPED_METRICS_METRIC,
    HARVEST_FAILED_METRIC, HARVEST_SKIPPED_TICKS_METRIC,
};
use crate::double_buffered_aggregator::DoubleBufferedAggregator;
use crate::metric::MetricSnapshot;
use crate::supportability::ApiSupportabilityCounters;
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Everything drained by one harvest cycle.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    #[serde(serialize_with = "serialize_epoch_secs")]
    pub window_start: SystemTime,
    #[serde(serialize_with = "serialize_epoch_secs")]
    pub window_end: SystemTime,
    pub metrics: MetricSnapshot,
    pub supportability: MetricSnapshot,
}

impl HarvestReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.supportability.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len() + self.supportability.len()
    }
}

fn serialize_epoch_secs<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    serializer.serialize_u64(secs)
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("collector rejected report: {0}")]
    Rejected(String),
}

/// Collaborator that delivers a harvested report to the collector.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn send(&self, report: &HarvestReport) -> Result<(), ReportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    Idle,
    Harvesting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestOutcome {
    /// The report was accepted by the reporter.
    Sent { records: usize },
    /// Nothing was recorded during the window.
    Empty,
    /// The reporter failed and the data will be carried into the next cycle.
    Retained { cycles: u32 },
    /// The reporter failed and the oldest retained cycles were discarded to
    /// stay within the retry bound.
    Dropped { records: usize },
    /// Another harvest was still in flight.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
pub struct HarvesterConfig {
    pub max_retained_cycles: u32,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            max_retained_cycles: DEFAULT_MAX_RETAINED_CYCLES,
        }
    }
}

pub struct Harvester {
    metrics: Arc<DoubleBufferedAggregator>,
    supportability: Arc<ApiSupportabilityCounters>,
    reporter: Arc<dyn Reporter>,
    config: HarvesterConfig,
    harvesting: AtomicBool,
    idle: Notify,
    /// Failed cycles not yet delivered, oldest first.
    retained: Mutex<VecDeque<HarvestReport>>,
    skipped_ticks: AtomicU64,
    window_start: Mutex<SystemTime>,
}

/// Returns the harvester to `Idle` however the harvest future ends.
struct InFlight<'a>(&'a Harvester);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.harvesting.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

impl Harvester {
    pub fn new(
        metrics: Arc<DoubleBufferedAggregator>,
        supportability: Arc<ApiSupportabilityCounters>,
        reporter: Arc<dyn Reporter>,
        config: HarvesterConfig,
    ) -> Self {
        Self {
            metrics,
            supportability,
            reporter,
            config,
            harvesting: AtomicBool::new(false),
            idle: Notify::new(),
            retained: Mutex::new(VecDeque::new()),
            skipped_ticks: AtomicU64::new(0),
            window_start: Mutex::new(SystemTime::now()),
        }
    }

    #[must_use]
    pub fn state(&self) -> HarvestState {
        if self.harvesting.load(Ordering::Acquire) {
            HarvestState::Harvesting
        } else {
            HarvestState::Idle
        }
    }

    #[must_use]
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retained_cycles(&self) -> u32 {
        let retained = self.retained.lock().unwrap_or_else(PoisonError::into_inner);
        u32::try_from(retained.len()).unwrap_or(u32::MAX)
    }

    /// Waits until no harvest is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state() == HarvestState::Idle {
                return;
            }
            notified.await;
        }
    }

    pub async fn harvest(&self) -> HarvestOutcome {
        if self
            .harvesting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let skipped = self.skipped_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            self.metrics.record_count(HARVEST_SKIPPED_TICKS_METRIC, 1);
            warn!("Harvest still in flight, skipping tick ({skipped} skipped so far)");
            return HarvestOutcome::Skipped;
        }
        let _in_flight = InFlight(self);

        let window_end = SystemTime::now();
        let cycle = HarvestReport {
            window_start: *self
                .window_start
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            window_end,
            metrics: self.metrics.snapshot_and_reset(),
            supportability: self.supportability.snapshot_and_reset(),
        };

        let report = {
            let retained = self.retained.lock().unwrap_or_else(PoisonError::into_inner);
            if cycle.is_empty() && retained.is_empty() {
                debug!("Nothing to harvest");
                return HarvestOutcome::Empty;
            }
            retained.iter().fold(
                HarvestReport {
                    window_start: retained
                        .front()
                        .map_or(cycle.window_start, |oldest| oldest.window_start),
                    window_end,
                    metrics: MetricSnapshot::new(),
                    supportability: MetricSnapshot::new(),
                },
                |mut report, failed| {
                    report.metrics.merge(&failed.metrics);
                    report.supportability.merge(&failed.supportability);
                    report
                },
            )
        };
        let report = HarvestReport {
            metrics: report.metrics.merged(&cycle.metrics),
            supportability: report.supportability.merged(&cycle.supportability),
            ..report
        };
        *self
            .window_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = window_end;

        let records = report.len();
        debug!(
            "Harvesting {} metrics and {} supportability counters",
            report.metrics.len(),
            report.supportability.len()
        );

        match self.reporter.send(&report).await {
            Ok(()) => {
                debug!("Successfully reported {records} records");
                self.retained
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                HarvestOutcome::Sent { records }
            }
            Err(e) => self.retain_or_evict(cycle, &e),
        }
    }

    /// Keeps the failed cycle for the next harvest. Once more than
    /// `max_retained_cycles` cycles are held, the oldest are evicted.
    fn retain_or_evict(&self, cycle: HarvestReport, e: &ReportError) -> HarvestOutcome {
        let (cycles, evicted, dropped) = {
            let mut retained = self.retained.lock().unwrap_or_else(PoisonError::into_inner);
            retained.push_back(cycle);
            let mut evicted = 0;
            let mut dropped = 0;
            while retained.len() > self.config.max_retained_cycles as usize {
                if let Some(oldest) = retained.pop_front() {
                    evicted += 1;
                    dropped += oldest.len();
                }
            }
            (retained.len(), evicted, dropped)
        };

        self.metrics.record_count(HARVEST_FAILED_METRIC, 1);
        if evicted > 0 {
            error!(
                "Failed to report harvest: {e}. Retry bound of {} cycles reached, dropping {dropped} records from the oldest cycles",
                self.config.max_retained_cycles
            );
            self.metrics
                .record_count(HARVEST_DROPPED_METRICS_METRIC, dropped as u64);
            return HarvestOutcome::Dropped { records: dropped };
        }

        error!("Failed to report harvest: {e}. Retaining data for the next cycle");
        HarvestOutcome::Retained {
            cycles: u32::try_from(cycles).unwrap_or(u32::MAX),
        }
    }
}

/// Drives a [`Harvester`] on a fixed interval until cancelled.
pub struct HarvestScheduler {
    harvester: Arc<Harvester>,
    period: Duration,
}

impl HarvestScheduler {
    #[must_use]
    pub fn new(harvester: Arc<Harvester>, period: Duration) -> Self {
        let period = if period.is_zero() {
            DEFAULT_HARVEST_INTERVAL
        } else {
            period
        };
        Self { harvester, period }
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks until `cancel` fires, then waits for any in-flight cycle and
    /// performs a final harvest.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let harvester = Arc::clone(&self.harvester);
                    tokio::spawn(async move {
                        harvester.harvest().await;
                    });
                }
                () = cancel.cancelled() => {
                    debug!("Harvest scheduler shutting down, performing final harvest");
                    self.harvester.wait_idle().await;
                    self.harvester.harvest().await;
                    break;
                }
            }
        }
    }
}
