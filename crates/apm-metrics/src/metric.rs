// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::time::Duration;
use ustr::{ustr, Ustr};

/// What a metric measures. The ordering is used when merging records of
/// mismatched kinds so that the merge stays commutative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[display("count")]
    Count,
    #[display("timing")]
    Timing,
    #[display("bytes")]
    Bytes,
}

/// Aggregate of every value recorded under one metric name.
///
/// `exclusive` carries self-time for timing records. For count and byte
/// records it always equals `total`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricData {
    pub kind: MetricKind,
    pub count: u64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

impl MetricData {
    #[must_use]
    pub fn new(kind: MetricKind, value: f64) -> Self {
        Self::with_exclusive(kind, value, value)
    }

    #[must_use]
    pub fn with_exclusive(kind: MetricKind, total: f64, exclusive: f64) -> Self {
        MetricData {
            kind,
            count: 1,
            total,
            exclusive,
            min: total,
            max: total,
            sum_of_squares: total * total,
        }
    }

    /// Record for `total`/`exclusive` durations, stored in seconds.
    #[must_use]
    pub fn timing(total: Duration, exclusive: Duration) -> Self {
        Self::with_exclusive(
            MetricKind::Timing,
            total.as_secs_f64(),
            exclusive.as_secs_f64(),
        )
    }

    /// Equivalent to `count` unit increments merged together.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn counted(count: u64) -> Self {
        let total = count as f64;
        MetricData {
            kind: MetricKind::Count,
            count,
            total,
            exclusive: total,
            min: 1.0,
            max: 1.0,
            sum_of_squares: total,
        }
    }

    pub fn add(&mut self, value: f64, exclusive: f64) {
        self.merge(&MetricData::with_exclusive(self.kind, value, exclusive));
    }

    /// Folds `other` into `self`. Sums add and extremes compare, so the
    /// operation is associative and commutative.
    pub fn merge(&mut self, other: &MetricData) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.kind = self.kind.max(other.kind);
        self.count += other.count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum_of_squares += other.sum_of_squares;
    }
}

/// Immutable result of draining an aggregator, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    metrics: HashMap<Ustr, MetricData, FnvBuildHasher>,
}

impl MetricSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_map(metrics: HashMap<Ustr, MetricData, FnvBuildHasher>) -> Self {
        MetricSnapshot { metrics }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricData> {
        self.metrics.get(&ustr(name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricData)> {
        self.metrics.iter().map(|(name, data)| (name.as_str(), data))
    }

    pub(crate) fn insert(&mut self, name: Ustr, data: MetricData) {
        self.metrics
            .entry(name)
            .and_modify(|existing| existing.merge(&data))
            .or_insert(data);
    }

    /// Folds every record of `other` into this snapshot.
    pub fn merge(&mut self, other: &MetricSnapshot) {
        for (name, data) in &other.metrics {
            self.insert(*name, *data);
        }
    }

    #[must_use]
    pub fn merged(mut self, other: &MetricSnapshot) -> MetricSnapshot {
        self.merge(other);
        self
    }
}

impl FromIterator<(Ustr, MetricData)> for MetricSnapshot {
    fn from_iter<T: IntoIterator<Item = (Ustr, MetricData)>>(iter: T) -> Self {
        let mut snapshot = MetricSnapshot::new();
        for (name, data) in iter {
            snapshot.insert(name, data);
        }
        snapshot
    }
}

impl Serialize for MetricSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut sorted: Vec<_> = self.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let mut map = serializer.serialize_map(Some(sorted.len()))?;
        for (name, data) in sorted {
            map.serialize_entry(name, data)?;
        }
        map.end()
    }
}
