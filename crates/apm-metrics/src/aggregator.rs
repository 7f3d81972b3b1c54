// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-buffer metric aggregation.

use crate::errors;
use crate::metric::{MetricData, MetricKind, MetricSnapshot};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use ustr::Ustr;

/// Accumulates metric records by name, up to `max_context` distinct names.
#[derive(Debug)]
pub struct Aggregator {
    map: HashMap<Ustr, MetricData, FnvBuildHasher>,
    max_context: usize,
}

impl Aggregator {
    pub fn new(max_context: usize) -> Result<Self, errors::Creation> {
        if max_context == 0 {
            return Err(errors::Creation::Contexts);
        }
        Ok(Self {
            map: HashMap::with_hasher(FnvBuildHasher::default()),
            max_context,
        })
    }

    pub fn record(&mut self, name: Ustr, value: f64, kind: MetricKind) -> Result<(), errors::Insert> {
        self.insert(name, MetricData::new(kind, value))
    }

    pub fn record_timing(
        &mut self,
        name: Ustr,
        total: f64,
        exclusive: f64,
    ) -> Result<(), errors::Insert> {
        self.insert(
            name,
            MetricData::with_exclusive(MetricKind::Timing, total, exclusive),
        )
    }

    /// Merges `data` into the entry for `name`, creating it if the context
    /// limit allows.
    pub fn insert(&mut self, name: Ustr, data: MetricData) -> Result<(), errors::Insert> {
        if let Some(existing) = self.map.get_mut(&name) {
            existing.merge(&data);
            return Ok(());
        }
        if self.map.len() >= self.max_context {
            return Err(errors::Insert::Overflow(self.max_context));
        }
        self.map.insert(name, data);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: Ustr) -> Option<&MetricData> {
        self.map.get(&name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drains every record, leaving the aggregator empty.
    pub fn consume(&mut self) -> MetricSnapshot {
        let capacity = self.map.len();
        let drained = std::mem::replace(
            &mut self.map,
            HashMap::with_capacity_and_hasher(capacity, FnvBuildHasher::default()),
        );
        MetricSnapshot::from_map(drained)
    }
}
