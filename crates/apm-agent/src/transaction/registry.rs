//! Active transactions keyed by execution context.
//!
//! A context holds at most one active transaction. Ending a transaction
//! records its timings into the shared aggregator before it is detached from
//! its context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use apm_metrics::double_buffered_aggregator::DoubleBufferedAggregator;
use tracing::{debug, warn};

use super::{
    ContextId, FinishedTransaction, NoticedError, Transaction, TransactionError,
    TransactionHandle, TransactionKind, TransactionStatus,
};

pub const ERRORS_ALL_METRIC: &str = "Errors/all";
/// Namespace of segment timings, kept apart from user-recorded metrics.
pub const SEGMENT_METRIC_PREFIX: &str = "Segment/";

const ABANDONED_ERROR_TYPE: &str = "AbandonedTransaction";

pub struct TransactionRegistry {
    active: Mutex<HashMap<ContextId, Arc<Transaction>>>,
    metrics: Arc<DoubleBufferedAggregator>,
}

impl TransactionRegistry {
    #[must_use]
    pub fn new(metrics: Arc<DoubleBufferedAggregator>) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn begin(
        &self,
        context: ContextId,
        kind: TransactionKind,
        name: &str,
    ) -> Result<TransactionHandle, TransactionError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&context) {
            return Err(TransactionError::AlreadyActive(context));
        }
        let transaction = Arc::new(Transaction::new(context, kind, name));
        active.insert(context, Arc::clone(&transaction));
        debug!(
            "Began {kind} transaction {} ({name}) in context {context}",
            transaction.id()
        );
        Ok(TransactionHandle::new(transaction))
    }

    #[must_use]
    pub fn current(&self, context: ContextId) -> Option<TransactionHandle> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&context)
            .cloned()
            .map(TransactionHandle::new)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Ends the transaction behind `handle`. Returns `false` for a handle that
    /// is stale or already ended.
    pub fn end(&self, handle: &TransactionHandle) -> bool {
        self.finish(handle, None)
    }

    /// Ends the transaction with `Errored` status.
    pub fn end_with_error(&self, handle: &TransactionHandle, error: NoticedError) -> bool {
        self.finish(handle, Some(error))
    }

    /// Finalizes the transaction of a context that was torn down without
    /// ending it.
    pub fn abandon(&self, context: ContextId) -> bool {
        let Some(handle) = self.current(context) else {
            return false;
        };
        debug!(
            "Abandoning transaction {} of torn down context {context}",
            handle.id()
        );
        self.end_with_error(
            &handle,
            NoticedError::new("execution context torn down", ABANDONED_ERROR_TYPE),
        )
    }

    /// Finalizes every transaction that has been active for longer than
    /// `max_age`. Returns how many were reaped.
    pub fn reap_abandoned(&self, max_age: Duration) -> usize {
        let expired: Vec<TransactionHandle> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|transaction| transaction.start().elapsed() > max_age)
            .cloned()
            .map(TransactionHandle::new)
            .collect();

        let reaped = expired
            .iter()
            .filter(|handle| {
                self.end_with_error(
                    handle,
                    NoticedError::new(
                        format!("transaction exceeded {}s without ending", max_age.as_secs()),
                        ABANDONED_ERROR_TYPE,
                    ),
                )
            })
            .count();
        if reaped > 0 {
            warn!("Reaped {reaped} abandoned transactions");
        }
        reaped
    }

    fn finish(&self, handle: &TransactionHandle, error: Option<NoticedError>) -> bool {
        if !self.is_attached(handle) {
            debug!(
                "Ignoring end of transaction {} which is not active in context {}",
                handle.id(),
                handle.context()
            );
            return false;
        }
        let Some(finished) = handle.inner().finish(error) else {
            debug!("Ignoring repeated end of transaction {}", handle.id());
            return false;
        };

        self.record(&finished);

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active
            .get(&handle.context())
            .is_some_and(|current| Arc::ptr_eq(current, handle.inner()))
        {
            active.remove(&handle.context());
        }
        true
    }

    fn is_attached(&self, handle: &TransactionHandle) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.context())
            .is_some_and(|current| Arc::ptr_eq(current, handle.inner()))
    }

    fn record(&self, finished: &FinishedTransaction) {
        if finished.ignored {
            debug!("Not recording ignored transaction {}", finished.metric_name);
            return;
        }

        let caller_metric = finished.parent.as_ref().map(|parent| {
            format!(
                "DurationByCaller/{}/{}/{}/{}/all",
                parent.payload_type, parent.account_id, parent.application_id, parent.transport
            )
        });

        // The root segment spans the whole transaction and is already
        // covered by the transaction metric.
        let segment_metrics: Vec<(String, Duration, Duration)> = finished
            .segments
            .iter()
            .filter(|segment| segment.depth > 0)
            .map(|segment| {
                (
                    format!("{SEGMENT_METRIC_PREFIX}{}", segment.name),
                    segment.total,
                    segment.exclusive,
                )
            })
            .collect();

        let mut timings = Vec::with_capacity(segment_metrics.len() + 3);
        timings.push((finished.metric_name.as_str(), finished.duration, finished.duration));
        timings.push((
            finished.kind.rollup_metric(),
            finished.duration,
            finished.duration,
        ));
        if let Some(caller_metric) = &caller_metric {
            timings.push((caller_metric.as_str(), finished.duration, finished.duration));
        }
        timings.extend(
            segment_metrics
                .iter()
                .map(|(name, total, exclusive)| (name.as_str(), *total, *exclusive)),
        );
        self.metrics.record_timings(timings);

        if finished.status == TransactionStatus::Errored {
            self.metrics.record_count(ERRORS_ALL_METRIC, 1);
            self.metrics
                .record_count(&format!("Errors/{}", finished.metric_name), 1);
        }
    }
}
