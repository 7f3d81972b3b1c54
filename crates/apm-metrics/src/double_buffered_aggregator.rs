// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::aggregator::Aggregator;
use crate::constants::METRIC_OVERFLOW_METRIC;
use crate::errors;
use crate::metric::{MetricData, MetricKind, MetricSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;
use ustr::{ustr, Ustr};

/// Process-wide metric aggregator with an atomic snapshot-and-reset.
///
/// Writers hold a shared guard on the active index for the length of one
/// write, so a snapshot cannot retire a buffer while a write into it is in
/// progress. The snapshot takes the exclusive guard only long enough to flip
/// the index, then drains the retired buffer.
pub struct DoubleBufferedAggregator {
    buffers: [Mutex<Aggregator>; 2],
    active_index: RwLock<usize>,
    flush_lock: Mutex<()>,
    overflows: AtomicU64,
}

impl DoubleBufferedAggregator {
    pub fn new(max_context: usize) -> Result<Self, errors::Creation> {
        Ok(Self {
            buffers: [
                Mutex::new(Aggregator::new(max_context)?),
                Mutex::new(Aggregator::new(max_context)?),
            ],
            active_index: RwLock::new(0),
            flush_lock: Mutex::new(()),
            overflows: AtomicU64::new(0),
        })
    }

    pub fn record(&self, name: &str, value: f64, kind: MetricKind) {
        self.with_active(|aggregator| rejected(aggregator.record(ustr(name), value, kind)));
    }

    pub fn record_count(&self, name: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.with_active(|aggregator| {
            rejected(aggregator.insert(ustr(name), MetricData::counted(count)))
        });
    }

    pub fn record_timing(&self, name: &str, total: Duration, exclusive: Duration) {
        self.with_active(|aggregator| {
            rejected(aggregator.record_timing(
                ustr(name),
                total.as_secs_f64(),
                exclusive.as_secs_f64(),
            ))
        });
    }

    /// Records a batch of timings under a single acquisition of the active
    /// buffer.
    pub fn record_timings<'a, I>(&self, timings: I)
    where
        I: IntoIterator<Item = (&'a str, Duration, Duration)>,
    {
        let timings: Vec<(Ustr, Duration, Duration)> = timings
            .into_iter()
            .map(|(name, total, exclusive)| (ustr(name), total, exclusive))
            .collect();
        self.with_active(|aggregator| {
            timings
                .into_iter()
                .map(|(name, total, exclusive)| {
                    rejected(aggregator.record_timing(
                        name,
                        total.as_secs_f64(),
                        exclusive.as_secs_f64(),
                    ))
                })
                .sum::<u64>()
        });
    }

    /// Folds a previously harvested snapshot back into the live buffer.
    pub fn merge_snapshot(&self, snapshot: &MetricSnapshot) {
        self.with_active(|aggregator| {
            snapshot
                .iter()
                .map(|(name, data)| rejected(aggregator.insert(ustr(name), *data)))
                .sum::<u64>()
        });
    }

    pub fn snapshot_and_reset(&self) -> MetricSnapshot {
        let _flush_guard = self
            .flush_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let retired = {
            let mut index = self
                .active_index
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let retired = *index;
            *index = 1 - retired;
            retired
        };

        let mut snapshot = self.buffers[retired]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .consume();

        let overflows = self.overflows.swap(0, Ordering::AcqRel);
        if overflows > 0 {
            debug!("{overflows} metric records dropped after reaching the context limit");
            snapshot.insert(ustr(METRIC_OVERFLOW_METRIC), MetricData::counted(overflows));
        }
        snapshot
    }

    /// Runs `write` against the active buffer. `write` returns how many
    /// records it could not insert.
    fn with_active<F>(&self, write: F)
    where
        F: FnOnce(&mut Aggregator) -> u64,
    {
        let index = self
            .active_index
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut aggregator = self.buffers[*index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let dropped = write(&mut aggregator);
        if dropped > 0 {
            self.overflows.fetch_add(dropped, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn active_len(&self) -> usize {
        let index = self
            .active_index
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        self.buffers[*index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn rejected(result: Result<(), errors::Insert>) -> u64 {
    u64::from(result.is_err())
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_double_buffer_switching() {
        let aggregator = DoubleBufferedAggregator::new(100).unwrap();

        aggregator.record("test1", 1.0, MetricKind::Count);
        assert_eq!(aggregator.active_len(), 1);

        let snapshot = aggregator.snapshot_and_reset();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(aggregator.active_len(), 0);

        aggregator.record("test2", 2.0, MetricKind::Count);
        assert_eq!(aggregator.active_len(), 1);
        let snapshot = aggregator.snapshot_and_reset();
        assert!(snapshot.get("test1").is_none());
        assert_eq!(snapshot.get("test2").unwrap().total, 2.0);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let aggregator = DoubleBufferedAggregator::new(100).unwrap();
        aggregator.record("a", 1.0, MetricKind::Count);

        assert_eq!(aggregator.snapshot_and_reset().len(), 1);
        assert!(aggregator.snapshot_and_reset().is_empty());
        assert!(aggregator.snapshot_and_reset().is_empty());
    }

    #[test]
    fn test_merge_snapshot_restores_records() {
        let aggregator = DoubleBufferedAggregator::new(100).unwrap();
        aggregator.record("fred", 1.0, MetricKind::Count);
        let first = aggregator.snapshot_and_reset();

        aggregator.record("fred", 1.0, MetricKind::Count);
        aggregator.merge_snapshot(&first);

        let merged = aggregator.snapshot_and_reset();
        let fred = merged.get("fred").unwrap();
        assert_eq!(fred.count, 2);
        assert_eq!(fred.total, 2.0);
    }

    #[test]
    fn test_overflow_is_counted() {
        let aggregator = DoubleBufferedAggregator::new(1).unwrap();
        aggregator.record("a", 1.0, MetricKind::Count);
        aggregator.record("b", 1.0, MetricKind::Count);
        aggregator.record("c", 1.0, MetricKind::Count);

        let snapshot = aggregator.snapshot_and_reset();
        assert!(snapshot.get("b").is_none());
        assert_eq!(snapshot.get(METRIC_OVERFLOW_METRIC).unwrap().count, 2);
        assert!(aggregator.snapshot_and_reset().is_empty());
    }

    #[test]
    fn test_overflow_counts_every_rejected_record_in_a_batch() {
        let aggregator = DoubleBufferedAggregator::new(1).unwrap();
        aggregator.record_timings([
            ("a", Duration::from_millis(4), Duration::from_millis(4)),
            ("b", Duration::from_millis(3), Duration::from_millis(3)),
            ("c", Duration::from_millis(2), Duration::from_millis(2)),
            ("d", Duration::from_millis(1), Duration::from_millis(1)),
        ]);
        assert_eq!(
            aggregator
                .snapshot_and_reset()
                .get(METRIC_OVERFLOW_METRIC)
                .unwrap()
                .count,
            3
        );

        let carried = {
            let wide = DoubleBufferedAggregator::new(10).unwrap();
            for name in ["x", "y", "z"] {
                wide.record(name, 1.0, MetricKind::Count);
            }
            wide.snapshot_and_reset()
        };
        aggregator.merge_snapshot(&carried);
        assert_eq!(
            aggregator
                .snapshot_and_reset()
                .get(METRIC_OVERFLOW_METRIC)
                .unwrap()
                .count,
            2
        );
    }

    #[test]
    fn test_record_timings_batch() {
        let aggregator = DoubleBufferedAggregator::new(100).unwrap();
        aggregator.record_timings([
            ("outer", Duration::from_secs(3), Duration::from_secs(1)),
            ("inner", Duration::from_secs(2), Duration::from_secs(2)),
        ]);

        let snapshot = aggregator.snapshot_and_reset();
        assert_eq!(snapshot.get("outer").unwrap().exclusive, 1.0);
        assert_eq!(snapshot.get("inner").unwrap().total, 2.0);
    }

    #[test]
    fn test_concurrent_increments_are_counted_exactly_once() {
        const WRITERS: u64 = 8;
        const PER_WRITER: u64 = 5_000;

        let aggregator = Arc::new(DoubleBufferedAggregator::new(1000).unwrap());

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                thread::spawn(move || {
                    for _ in 0..PER_WRITER {
                        aggregator.record("hits", 1.0, MetricKind::Count);
                    }
                })
            })
            .collect();

        let harvester = {
            let aggregator = Arc::clone(&aggregator);
            thread::spawn(move || {
                let mut harvested = 0;
                for _ in 0..50 {
                    if let Some(data) = aggregator.snapshot_and_reset().get("hits") {
                        harvested += data.count;
                    }
                    thread::yield_now();
                }
                harvested
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        let harvested = harvester.join().unwrap();
        let remaining = aggregator
            .snapshot_and_reset()
            .get("hits")
            .map_or(0, |data| data.count);

        assert_eq!(harvested + remaining, WRITERS * PER_WRITER);
    }
}
