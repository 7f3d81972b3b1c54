// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters recording how often each public agent API is invoked.
//!
//! Every externally callable operation increments exactly one counter named
//! `Supportability/ApiInvocation/<ApiName>`, whether or not the operation
//! itself succeeds. Counters are plain atomics so an increment never blocks
//! the caller, and draining swaps each one back to zero.

use crate::constants::API_INVOCATION_PREFIX;
use crate::metric::{MetricData, MetricSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use ustr::ustr;

macro_rules! api_methods {
    ($($variant:ident),+ $(,)?) => {
        /// Public API operations tracked by supportability counters.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
        pub enum ApiMethod {
            $($variant,)+
        }

        impl ApiMethod {
            pub const ALL: &'static [ApiMethod] = &[$(ApiMethod::$variant,)+];

            /// Name of the supportability metric for this operation.
            #[must_use]
            pub const fn metric_name(self) -> &'static str {
                match self {
                    $(ApiMethod::$variant => concat!("Supportability/ApiInvocation/", stringify!($variant)),)+
                }
            }
        }
    };
}

api_methods!(
    AcceptDistributedTracePayload,
    AddCustomParameter,
    CreateDistributedTracePayload,
    CurrentTransaction,
    DisableBrowserMonitoring,
    GetBrowserTimingFooter,
    GetBrowserTimingHeader,
    IgnoreApdex,
    IgnoreTransaction,
    IncrementCounter,
    NoticeError,
    RecordCustomEvent,
    RecordMetric,
    RecordResponseTimeMetric,
    SetApplicationName,
    SetTransactionName,
    SetUserParameters,
    StartAgent,
);

impl ApiMethod {
    fn index(self) -> usize {
        self as usize
    }

    /// Looks an operation up by its bare name, e.g. `"AddCustomParameter"`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<ApiMethod> {
        ApiMethod::ALL
            .iter()
            .copied()
            .find(|method| &method.metric_name()[API_INVOCATION_PREFIX.len()..] == name)
    }
}

pub struct ApiSupportabilityCounters {
    counters: Vec<AtomicU64>,
    enabled: bool,
}

impl Default for ApiSupportabilityCounters {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ApiSupportabilityCounters {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            counters: ApiMethod::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
            enabled,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn increment(&self, api: ApiMethod) {
        if self.enabled {
            self.counters[api.index()].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Invocations of `api` since the last drain.
    #[must_use]
    pub fn count(&self, api: ApiMethod) -> u64 {
        self.counters[api.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot_and_reset(&self) -> MetricSnapshot {
        ApiMethod::ALL
            .iter()
            .filter_map(|api| {
                let count = self.counters[api.index()].swap(0, Ordering::AcqRel);
                (count > 0).then(|| (ustr(api.metric_name()), MetricData::counted(count)))
            })
            .collect()
    }

    /// Adds back the counts of an unsent snapshot. Names that are not API
    /// invocation counters are ignored.
    pub fn merge_snapshot(&self, snapshot: &MetricSnapshot) {
        for (name, data) in snapshot.iter() {
            let Some(api) = name
                .strip_prefix(API_INVOCATION_PREFIX)
                .and_then(ApiMethod::from_name)
            else {
                continue;
            };
            self.counters[api.index()].fetch_add(data.count, Ordering::AcqRel);
        }
    }
}
