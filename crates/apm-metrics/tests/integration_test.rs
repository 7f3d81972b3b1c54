// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use apm_metrics::{
    constants::{HARVEST_DROPPED_METRICS_METRIC, HARVEST_FAILED_METRIC},
    double_buffered_aggregator::DoubleBufferedAggregator,
    harvest::{
        HarvestOutcome, HarvestReport, HarvestScheduler, Harvester, HarvesterConfig, ReportError,
        Reporter,
    },
    metric::MetricKind,
    supportability::{ApiMethod, ApiSupportabilityCounters},
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct CollectorStub {
    down: AtomicBool,
    received: Mutex<Vec<HarvestReport>>,
}

#[async_trait]
impl Reporter for CollectorStub {
    async fn send(&self, report: &HarvestReport) -> Result<(), ReportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ReportError::Transport("connection refused".to_string()));
        }
        self.received.lock().unwrap().push(report.clone());
        Ok(())
    }
}

struct Pipeline {
    metrics: Arc<DoubleBufferedAggregator>,
    supportability: Arc<ApiSupportabilityCounters>,
    collector: Arc<CollectorStub>,
    harvester: Arc<Harvester>,
}

fn pipeline(max_retained_cycles: u32) -> Pipeline {
    let metrics = Arc::new(DoubleBufferedAggregator::new(1000).unwrap());
    let supportability = Arc::new(ApiSupportabilityCounters::default());
    let collector = Arc::new(CollectorStub::default());
    let harvester = Arc::new(Harvester::new(
        Arc::clone(&metrics),
        Arc::clone(&supportability),
        collector.clone(),
        HarvesterConfig {
            max_retained_cycles,
        },
    ));
    Pipeline {
        metrics,
        supportability,
        collector,
        harvester,
    }
}

#[cfg(test)]
#[tokio::test]
#[allow(clippy::float_cmp)]
async fn user_metric_accumulates_within_a_window() {
    let p = pipeline(5);
    p.metrics.record("fred", 1.0, MetricKind::Count);
    p.metrics.record("fred", 1.0, MetricKind::Count);

    assert_eq!(
        p.harvester.harvest().await,
        HarvestOutcome::Sent { records: 1 }
    );
    let received = p.collector.received.lock().unwrap();
    let fred = received[0].metrics.get("fred").unwrap();
    assert_eq!(fred.count, 2);
    assert_eq!(fred.total, 2.0);
}

#[cfg(test)]
#[tokio::test]
async fn failed_cycle_is_carried_into_the_next_report() {
    let p = pipeline(5);
    p.metrics.record("window/n", 1.0, MetricKind::Count);
    p.supportability.increment(ApiMethod::NoticeError);
    p.collector.down.store(true, Ordering::SeqCst);

    assert_eq!(
        p.harvester.harvest().await,
        HarvestOutcome::Retained { cycles: 1 }
    );

    p.metrics.record("window/n+1", 1.0, MetricKind::Count);
    p.supportability.increment(ApiMethod::NoticeError);
    p.collector.down.store(false, Ordering::SeqCst);

    assert!(matches!(
        p.harvester.harvest().await,
        HarvestOutcome::Sent { .. }
    ));
    let received = p.collector.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let report = &received[0];
    assert!(report.metrics.get("window/n").is_some());
    assert!(report.metrics.get("window/n+1").is_some());
    assert_eq!(report.metrics.get(HARVEST_FAILED_METRIC).unwrap().count, 1);
    assert_eq!(
        report
            .supportability
            .get(ApiMethod::NoticeError.metric_name())
            .unwrap()
            .count,
        2
    );
}

#[cfg(test)]
#[tokio::test]
async fn prolonged_outage_drops_data_and_records_the_drop() {
    let p = pipeline(1);
    p.metrics.record("lost", 1.0, MetricKind::Count);
    p.collector.down.store(true, Ordering::SeqCst);

    assert_eq!(
        p.harvester.harvest().await,
        HarvestOutcome::Retained { cycles: 1 }
    );
    assert!(matches!(
        p.harvester.harvest().await,
        HarvestOutcome::Dropped { .. }
    ));

    p.collector.down.store(false, Ordering::SeqCst);
    assert!(matches!(
        p.harvester.harvest().await,
        HarvestOutcome::Sent { .. }
    ));
    let received = p.collector.received.lock().unwrap();
    let report = &received[0];
    assert!(report.metrics.get("lost").is_none());
    assert!(report.metrics.get(HARVEST_DROPPED_METRICS_METRIC).is_some());
}

#[cfg(test)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_harvests_lose_no_increments() {
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 20_000;

    let p = pipeline(5);
    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(
        HarvestScheduler::new(Arc::clone(&p.harvester), Duration::from_millis(5))
            .run(cancel.clone()),
    );

    let writers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let metrics = Arc::clone(&p.metrics);
            let supportability = Arc::clone(&p.supportability);
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    metrics.record("hits", 1.0, MetricKind::Count);
                    if i % 100 == 0 {
                        supportability.increment(ApiMethod::IncrementCounter);
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    scheduler.await.unwrap();
    loop {
        match p.harvester.harvest().await {
            HarvestOutcome::Empty => break,
            HarvestOutcome::Skipped => p.harvester.wait_idle().await,
            _ => {}
        }
    }

    let received = p.collector.received.lock().unwrap();
    let hits: u64 = received
        .iter()
        .filter_map(|report| report.metrics.get("hits"))
        .map(|data| data.count)
        .sum();
    let api_calls: u64 = received
        .iter()
        .filter_map(|report| {
            report
                .supportability
                .get(ApiMethod::IncrementCounter.metric_name())
        })
        .map(|data| data.count)
        .sum();
    assert_eq!(hits, WRITERS * PER_WRITER);
    assert_eq!(api_calls, WRITERS * PER_WRITER / 100);
}
