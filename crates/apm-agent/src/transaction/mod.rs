//! Transactions: the unit of work tracked by the agent.
//!
//! A transaction is owned by exactly one execution context while it is
//! active. Handles are cheap clones of a shared reference; all mutable state
//! sits behind one lock per transaction so fan-out work on other threads can
//! attach segments safely.

pub mod registry;
pub mod segment;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::distributed_trace::payload::PayloadType;
use crate::distributed_trace::TransportType;
use segment::{SegmentHandle, SegmentTiming, SegmentTree, ROOT_SEGMENT};

pub use registry::TransactionRegistry;

/// Longest custom attribute key accepted, in bytes.
pub const MAX_ATTRIBUTE_KEY_BYTES: usize = 255;

/// Most custom attributes a single transaction keeps.
pub const MAX_ATTRIBUTES: usize = 64;

/// Opaque identifier of a logical execution context (a request, a task, a
/// thread). Supplied by the instrumentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct ContextId(pub u64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("context {0} already has an active transaction")]
    AlreadyActive(ContextId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum TransactionKind {
    Web,
    Other,
}

impl TransactionKind {
    #[must_use]
    pub fn metric_prefix(self) -> &'static str {
        match self {
            TransactionKind::Web => "WebTransaction",
            TransactionKind::Other => "OtherTransaction",
        }
    }

    #[must_use]
    pub fn rollup_metric(self) -> &'static str {
        match self {
            TransactionKind::Web => "WebTransaction",
            TransactionKind::Other => "OtherTransaction/all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TransactionStatus {
    Active,
    Ended,
    Errored,
}

/// Scalar value of a custom attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// An error noticed on a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoticedError {
    pub message: String,
    pub error_type: String,
}

impl NoticedError {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
        }
    }
}

/// Upstream caller details taken from an accepted distributed trace payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentTrace {
    pub payload_type: PayloadType,
    pub account_id: String,
    pub application_id: String,
    pub parent_span_id: Option<String>,
    pub transaction_id: Option<String>,
    pub transport: TransportType,
    pub transport_duration: Duration,
}

/// Distributed trace linkage of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceContext {
    pub trace_id: String,
    /// `None` until the transaction inherits or makes a sampling decision.
    pub sampled: Option<bool>,
    pub priority: Option<f32>,
    pub parent: Option<ParentTrace>,
    pub(crate) payload_created: bool,
}

#[derive(Debug)]
pub(crate) struct TransactionState {
    pub(crate) name: String,
    pub(crate) status: TransactionStatus,
    pub(crate) tree: SegmentTree,
    pub(crate) attributes: BTreeMap<String, AttributeValue>,
    pub(crate) trace: TraceContext,
    pub(crate) ignored: bool,
    pub(crate) ignore_apdex: bool,
    pub(crate) browser_monitoring_disabled: bool,
    pub(crate) error: Option<NoticedError>,
    pub(crate) duration: Option<Duration>,
}

/// Everything the registry needs to record once a transaction has ended.
#[derive(Debug)]
pub(crate) struct FinishedTransaction {
    pub(crate) metric_name: String,
    pub(crate) kind: TransactionKind,
    pub(crate) duration: Duration,
    pub(crate) segments: Vec<SegmentTiming>,
    pub(crate) status: TransactionStatus,
    pub(crate) ignored: bool,
    pub(crate) parent: Option<ParentTrace>,
}

#[derive(Debug)]
pub struct Transaction {
    id: String,
    context: ContextId,
    kind: TransactionKind,
    start: Instant,
    start_time: SystemTime,
    state: Mutex<TransactionState>,
}

fn generate_guid() -> String {
    format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..))
}

impl Transaction {
    pub(crate) fn new(context: ContextId, kind: TransactionKind, name: &str) -> Self {
        let id = generate_guid();
        let start = Instant::now();
        Self {
            context,
            kind,
            start,
            start_time: SystemTime::now(),
            state: Mutex::new(TransactionState {
                name: name.to_string(),
                status: TransactionStatus::Active,
                tree: SegmentTree::new(name, start),
                attributes: BTreeMap::new(),
                trace: TraceContext {
                    trace_id: id.clone(),
                    sampled: None,
                    priority: None,
                    parent: None,
                    payload_created: false,
                },
                ignored: false,
                ignore_apdex: false,
                browser_monitoring_disabled: false,
                error: None,
                duration: None,
            }),
            id,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn start(&self) -> Instant {
        self.start
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut TransactionState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Closes the transaction. Returns `None` if it had already ended.
    pub(crate) fn finish(&self, error: Option<NoticedError>) -> Option<FinishedTransaction> {
        self.with_state(|state| {
            if state.status != TransactionStatus::Active {
                return None;
            }
            let now = Instant::now();
            let forced = state.tree.force_close(now);
            // The root segment is always open until here.
            if forced > 1 {
                debug!(
                    "Force-closed {} open segments of transaction {}",
                    forced - 1,
                    self.id
                );
            }
            if error.is_some() {
                state.error = error;
            }
            state.status = if state.error.is_some() {
                TransactionStatus::Errored
            } else {
                TransactionStatus::Ended
            };
            let duration = now.saturating_duration_since(self.start);
            state.duration = Some(duration);

            Some(FinishedTransaction {
                metric_name: format!("{}/{}", self.kind.metric_prefix(), state.name),
                kind: self.kind,
                duration,
                segments: state.tree.timings(),
                status: state.status,
                ignored: state.ignored,
                parent: state.trace.parent.clone(),
            })
        })
    }
}

/// Shared handle to a transaction.
#[derive(Debug, Clone)]
pub struct TransactionHandle(Arc<Transaction>);

impl TransactionHandle {
    pub(crate) fn new(transaction: Arc<Transaction>) -> Self {
        Self(transaction)
    }

    pub(crate) fn inner(&self) -> &Arc<Transaction> {
        &self.0
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.0.id()
    }

    #[must_use]
    pub fn context(&self) -> ContextId {
        self.0.context
    }

    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        self.0.kind
    }

    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.0.start_time
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.0.with_state(|state| state.name.clone())
    }

    #[must_use]
    pub fn metric_name(&self) -> String {
        format!("{}/{}", self.kind().metric_prefix(), self.name())
    }

    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.0.with_state(|state| state.status)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// Wall time between begin and end; `None` while active.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.0.with_state(|state| state.duration)
    }

    /// Time since the transaction started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.0.start().elapsed()
    }

    /// Starts a segment directly under the transaction's root segment.
    #[must_use]
    pub fn start_segment(&self, name: &str) -> SegmentHandle {
        SegmentHandle::start(&self.0, ROOT_SEGMENT, name)
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.0.with_state(|state| state.tree.len())
    }

    /// Renames the transaction. Ignored once it has ended.
    pub fn set_name(&self, name: &str) -> bool {
        self.0.with_state(|state| {
            if state.status != TransactionStatus::Active {
                return false;
            }
            state.name = name.to_string();
            true
        })
    }

    pub fn add_attribute(&self, key: &str, value: impl Into<AttributeValue>) -> bool {
        if key.is_empty() || key.len() > MAX_ATTRIBUTE_KEY_BYTES {
            debug!("Ignoring custom attribute with invalid key length {}", key.len());
            return false;
        }
        let value = value.into();
        self.0.with_state(|state| {
            if state.status != TransactionStatus::Active {
                return false;
            }
            if state.attributes.len() >= MAX_ATTRIBUTES && !state.attributes.contains_key(key) {
                debug!(
                    "Dropping custom attribute {key}: transaction {} already has {MAX_ATTRIBUTES}",
                    self.0.id
                );
                return false;
            }
            state.attributes.insert(key.to_string(), value);
            true
        })
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<AttributeValue> {
        self.0.with_state(|state| state.attributes.get(key).cloned())
    }

    #[must_use]
    pub fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        self.0.with_state(|state| state.attributes.clone())
    }

    /// Marks the transaction so that nothing is recorded when it ends.
    pub fn ignore(&self) {
        self.0.with_state(|state| state.ignored = true);
    }

    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.0.with_state(|state| state.ignored)
    }

    pub fn ignore_apdex(&self) {
        self.0.with_state(|state| state.ignore_apdex = true);
    }

    #[must_use]
    pub fn is_apdex_ignored(&self) -> bool {
        self.0.with_state(|state| state.ignore_apdex)
    }

    /// Suppresses the browser timing snippets for this transaction.
    pub fn disable_browser_monitoring(&self) {
        self.0
            .with_state(|state| state.browser_monitoring_disabled = true);
    }

    #[must_use]
    pub fn is_browser_monitoring_disabled(&self) -> bool {
        self.0.with_state(|state| state.browser_monitoring_disabled)
    }

    /// Attaches an error; the transaction ends as `Errored`. The last error
    /// noticed wins.
    pub fn notice_error(&self, error: NoticedError) -> bool {
        self.0.with_state(|state| {
            if state.status != TransactionStatus::Active {
                return false;
            }
            state.error = Some(error);
            true
        })
    }

    #[must_use]
    pub fn error(&self) -> Option<NoticedError> {
        self.0.with_state(|state| state.error.clone())
    }

    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        self.0.with_state(|state| state.trace.clone())
    }

    #[must_use]
    pub fn trace_id(&self) -> String {
        self.0.with_state(|state| state.trace.trace_id.clone())
    }
}

impl PartialEq for TransactionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TransactionHandle {}
