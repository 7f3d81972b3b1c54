// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Maximum number of distinct metric names held by one aggregator buffer.
pub const MAX_CONTEXTS: usize = 10_000;

/// Default cadence of the harvest cycle.
pub const DEFAULT_HARVEST_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive failed harvests whose data is carried forward before it is dropped.
pub const DEFAULT_MAX_RETAINED_CYCLES: u32 = 5;

pub const API_INVOCATION_PREFIX: &str = "Supportability/ApiInvocation/";

pub const METRIC_OVERFLOW_METRIC: &str = "Supportability/MetricAggregator/Overflow";
pub const HARVEST_SKIPPED_TICKS_METRIC: &str = "Supportability/Harvest/SkippedTicks";
pub const HARVEST_DROPPED_METRICS_METRIC: &str = "Supportability/Harvest/DroppedMetrics";
pub const HARVEST_FAILED_METRIC: &str = "Supportability/Harvest/Failed";

pub const DT_ACCEPT_SUCCESS_METRIC: &str = "Supportability/DistributedTrace/AcceptPayload/Success";
pub const DT_ACCEPT_EXCEPTION_METRIC: &str = "Supportability/DistributedTrace/AcceptPayload/Exception";
pub const DT_ACCEPT_PARSE_EXCEPTION_METRIC: &str =
    "Supportability/DistributedTrace/AcceptPayload/ParseException";
pub const DT_ACCEPT_IGNORED_NULL_METRIC: &str =
    "Supportability/DistributedTrace/AcceptPayload/Ignored/Null";
pub const DT_ACCEPT_IGNORED_MAJOR_VERSION_METRIC: &str =
    "Supportability/DistributedTrace/AcceptPayload/Ignored/MajorVersion";
pub const DT_ACCEPT_IGNORED_UNTRUSTED_ACCOUNT_METRIC: &str =
    "Supportability/DistributedTrace/AcceptPayload/Ignored/UntrustedAccount";
pub const DT_ACCEPT_IGNORED_MULTIPLE_METRIC: &str =
    "Supportability/DistributedTrace/AcceptPayload/Ignored/Multiple";
pub const DT_ACCEPT_IGNORED_CREATE_BEFORE_ACCEPT_METRIC: &str =
    "Supportability/DistributedTrace/AcceptPayload/Ignored/CreateBeforeAccept";
pub const DT_CREATE_SUCCESS_METRIC: &str = "Supportability/DistributedTrace/CreatePayload/Success";
pub const DT_CREATE_EXCEPTION_METRIC: &str =
    "Supportability/DistributedTrace/CreatePayload/Exception";
