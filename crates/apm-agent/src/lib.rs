//! In-process APM agent core.
//!
//! Tracks transactions and their segments per execution context, links them
//! across services with distributed trace payloads, counts public API usage,
//! and periodically harvests the aggregated metrics to a [`Reporter`].
//!
//! ```text
//! instrumentation events ─▶ InstrumentationEvents ─▶ TransactionRegistry
//!                                                         │ on end
//! AgentApi ─▶ ApiSupportabilityCounters                   ▼
//!      │                                  DoubleBufferedAggregator
//!      └─▶ DistributedTraceService ─────────────────▲      │
//!                                                        ▼
//!                                     HarvestScheduler ─▶ Reporter
//! ```
//!
//! [`Reporter`]: apm_metrics::harvest::Reporter

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![allow(clippy::missing_errors_doc)]

/// Agent lifecycle and background tasks
pub mod agent;

/// Public API surface, counted by supportability metrics
pub mod api;

/// Configuration sources and log level
pub mod config;

/// Buffered custom events
pub mod custom_event;

/// Distributed trace payloads and carriers
pub mod distributed_trace;

/// Enter/exit hook adapter
pub mod instrumentation;

/// Log formatting and subscriber setup
pub mod logger;

/// Reporter that logs harvested reports
pub mod reporter;

/// Transactions, segments and the per-context registry
pub mod transaction;
