//! Distributed trace linkage between services.
//!
//! An outbound call asks for a payload describing the current transaction
//! (`create`) and hands it to the callee, usually through the `newrelic`
//! header. The callee `accept`s it, which links its own transaction into the
//! caller's trace. Every outcome, success or not, is counted in a
//! `Supportability/DistributedTrace/...` metric.
//!
//! ```text
//! caller txn ──create──▶ payload ──header──▶ accept ──▶ callee txn
//!                                                 (inherits trace id,
//!                                                  sampled, priority)
//! ```

pub mod carrier;
pub mod error;
pub mod payload;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use apm_metrics::constants::{
    DT_ACCEPT_SUCCESS_METRIC, DT_CREATE_EXCEPTION_METRIC, DT_CREATE_SUCCESS_METRIC,
};
use apm_metrics::double_buffered_aggregator::DoubleBufferedAggregator;
use tracing::debug;

use crate::config::Config;
use crate::transaction::{ParentTrace, TransactionHandle, TransactionStatus};
use carrier::{Extractor, Injector, PAYLOAD_HEADER};
use error::DistributedTraceError;
use payload::{DistributedTracePayload, PayloadData, PayloadType};

/// Transport the inbound payload arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, derive_more::Display)]
pub enum TransportType {
    #[default]
    #[display("Unknown")]
    Unknown,
    #[display("HTTP")]
    Http,
    #[display("HTTPS")]
    Https,
    #[display("Kafka")]
    Kafka,
    #[display("JMS")]
    Jms,
    #[display("IronMQ")]
    IronMq,
    #[display("AMQP")]
    Amqp,
    #[display("Queue")]
    Queue,
    #[display("Other")]
    Other,
}

/// Result of a successful accept.
#[derive(Debug, Clone, PartialEq)]
pub struct Linked {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub parent_transaction_id: Option<String>,
    pub sampled: Option<bool>,
    pub priority: Option<f32>,
    pub transport_duration: Duration,
}

pub struct DistributedTraceService {
    enabled: bool,
    account_id: String,
    application_id: String,
    trusted_account_key: String,
    metrics: Arc<DoubleBufferedAggregator>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Id of the outbound call a payload is created for. Each payload stands for
/// its own exit span, so two calls from one transaction get distinct ids
/// while sharing the transaction id.
fn generate_span_id() -> String {
    format!("{:016x}", fastrand::u64(..))
}

/// Sampled transactions rank above unsampled ones; the fraction breaks ties.
fn sampled_priority() -> f32 {
    let priority = 1.0 + fastrand::f32();
    (priority * 1_000_000.0).round() / 1_000_000.0
}

impl DistributedTraceService {
    #[must_use]
    pub fn new(config: &Config, metrics: Arc<DoubleBufferedAggregator>) -> Self {
        Self {
            enabled: config.distributed_tracing_enabled,
            account_id: config.account_id.clone(),
            application_id: config.primary_application_id.clone(),
            trusted_account_key: config.trusted_account_key.clone(),
            metrics,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Builds the outbound payload for an active transaction.
    ///
    /// The payload's `id` is a fresh span id naming this outbound call; `tx`
    /// carries the transaction id.
    pub fn create(
        &self,
        transaction: &TransactionHandle,
    ) -> Result<DistributedTracePayload, DistributedTraceError> {
        self.counted_create(transaction, Ok)
    }

    /// Creates a payload in its base64 header form.
    pub fn create_http_safe(
        &self,
        transaction: &TransactionHandle,
    ) -> Result<String, DistributedTraceError> {
        self.counted_create(transaction, |payload| {
            payload
                .encode_http_safe()
                .map_err(|e| DistributedTraceError::EncodeError(e.to_string()))
        })
    }

    /// Creates a payload and hands it to `finish`. The combined outcome is
    /// counted once as a create success or exception.
    fn counted_create<T>(
        &self,
        transaction: &TransactionHandle,
        finish: impl FnOnce(DistributedTracePayload) -> Result<T, DistributedTraceError>,
    ) -> Result<T, DistributedTraceError> {
        let result = self.try_create(transaction).and_then(finish);
        match &result {
            Ok(_) => self.metrics.record_count(DT_CREATE_SUCCESS_METRIC, 1),
            Err(e) => {
                debug!("Cannot create distributed trace payload: {e}");
                self.metrics.record_count(DT_CREATE_EXCEPTION_METRIC, 1);
            }
        }
        result
    }

    fn try_create(
        &self,
        transaction: &TransactionHandle,
    ) -> Result<DistributedTracePayload, DistributedTraceError> {
        if !self.enabled {
            return Err(DistributedTraceError::Disabled);
        }
        transaction.inner().with_state(|state| {
            if state.status != TransactionStatus::Active {
                return Err(DistributedTraceError::InactiveTransaction);
            }
            if state.trace.sampled.is_none() {
                state.trace.sampled = Some(true);
                state.trace.priority = Some(sampled_priority());
            }
            state.trace.payload_created = true;

            Ok(DistributedTracePayload::new(PayloadData {
                payload_type: PayloadType::App,
                account_id: self.account_id.clone(),
                application_id: self.application_id.clone(),
                trusted_account_key: (self.trusted_account_key != self.account_id)
                    .then(|| self.trusted_account_key.clone()),
                trace_id: state.trace.trace_id.clone(),
                span_id: Some(generate_span_id()),
                transaction_id: Some(transaction.id().to_string()),
                sampled: state.trace.sampled,
                priority: state.trace.priority,
                timestamp_ms: now_ms(),
            }))
        })
    }

    /// Links `transaction` to the caller described by `text` (JSON or
    /// base64-encoded JSON).
    pub fn accept(
        &self,
        transaction: &TransactionHandle,
        text: &str,
        transport: TransportType,
    ) -> Result<Linked, DistributedTraceError> {
        let result = self.try_accept(transaction, text, transport);
        match &result {
            Ok(linked) => {
                debug!(
                    "Transaction {} joined trace {}",
                    transaction.id(),
                    linked.trace_id
                );
                self.metrics.record_count(DT_ACCEPT_SUCCESS_METRIC, 1);
            }
            Err(e) => {
                debug!("Ignoring inbound distributed trace payload: {e}");
                self.metrics.record_count(e.accept_metric(), 1);
            }
        }
        result
    }

    fn try_accept(
        &self,
        transaction: &TransactionHandle,
        text: &str,
        transport: TransportType,
    ) -> Result<Linked, DistributedTraceError> {
        if !self.enabled {
            return Err(DistributedTraceError::Disabled);
        }
        transaction
            .inner()
            .with_state(|state| Self::check_acceptable(state.status, &state.trace))?;

        let payload = DistributedTracePayload::decode(text)?;
        let trust_key = payload.effective_trust_key();
        if self.trusted_account_key.is_empty() || trust_key != self.trusted_account_key {
            return Err(DistributedTraceError::UntrustedAccount(trust_key.to_string()));
        }

        let transport_duration =
            Duration::from_millis(now_ms().saturating_sub(payload.timestamp_ms()));

        transaction.inner().with_state(|state| {
            // Re-checked under the same lock that links, in case of a racing accept.
            Self::check_acceptable(state.status, &state.trace)?;

            state.trace.trace_id = payload.trace_id().to_string();
            if state.trace.sampled.is_none() {
                state.trace.sampled = payload.sampled();
                state.trace.priority = payload.priority();
            }
            state.trace.parent = Some(ParentTrace {
                payload_type: payload.payload_type(),
                account_id: payload.account_id().to_string(),
                application_id: payload.application_id().to_string(),
                parent_span_id: payload.span_id().map(str::to_string),
                transaction_id: payload.transaction_id().map(str::to_string),
                transport,
                transport_duration,
            });

            Ok(Linked {
                trace_id: state.trace.trace_id.clone(),
                parent_span_id: payload.span_id().map(str::to_string),
                parent_transaction_id: payload.transaction_id().map(str::to_string),
                sampled: state.trace.sampled,
                priority: state.trace.priority,
                transport_duration,
            })
        })
    }

    fn check_acceptable(
        status: TransactionStatus,
        trace: &crate::transaction::TraceContext,
    ) -> Result<(), DistributedTraceError> {
        if status != TransactionStatus::Active {
            return Err(DistributedTraceError::InactiveTransaction);
        }
        if trace.parent.is_some() {
            return Err(DistributedTraceError::AlreadyAccepted);
        }
        if trace.payload_created {
            return Err(DistributedTraceError::AcceptAfterCreate);
        }
        Ok(())
    }

    /// Creates a payload and writes it base64-encoded into the carrier's
    /// `newrelic` entry.
    pub fn inject(
        &self,
        transaction: &TransactionHandle,
        carrier: &mut dyn Injector,
    ) -> Result<(), DistributedTraceError> {
        let encoded = self.create_http_safe(transaction)?;
        carrier.set(PAYLOAD_HEADER, encoded);
        Ok(())
    }

    /// Accepts the payload found in the carrier's `newrelic` entry. A
    /// missing entry counts as an empty payload.
    pub fn extract(
        &self,
        transaction: &TransactionHandle,
        carrier: &dyn Extractor,
        transport: TransportType,
    ) -> Result<Linked, DistributedTraceError> {
        let text = carrier.get(PAYLOAD_HEADER).unwrap_or_default();
        self.accept(transaction, text, transport)
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::transaction::{ContextId, TransactionKind, TransactionRegistry};
    use apm_metrics::constants::DT_ACCEPT_PARSE_EXCEPTION_METRIC;
    use apm_metrics::metric::MetricSnapshot;
    use std::collections::HashMap;

    struct Fixture {
        service: DistributedTraceService,
        registry: TransactionRegistry,
        metrics: Arc<DoubleBufferedAggregator>,
    }

    fn config() -> Config {
        Config {
            account_id: "33".to_string(),
            primary_application_id: "5043".to_string(),
            trusted_account_key: "33".to_string(),
            ..Config::default()
        }
    }

    fn fixture(config: &Config) -> Fixture {
        let metrics = Arc::new(DoubleBufferedAggregator::new(1000).unwrap());
        Fixture {
            service: DistributedTraceService::new(config, Arc::clone(&metrics)),
            registry: TransactionRegistry::new(Arc::clone(&metrics)),
            metrics,
        }
    }

    fn count(snapshot: &MetricSnapshot, name: &str) -> u64 {
        snapshot.get(name).map_or(0, |data| data.count)
    }

    #[test]
    fn test_create_then_accept_links_trace() {
        let f = fixture(&config());
        let caller = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "caller")
            .unwrap();
        let callee = f
            .registry
            .begin(ContextId(2), TransactionKind::Web, "callee")
            .unwrap();

        let payload = f.service.create(&caller).unwrap();
        assert_eq!(payload.trace_id(), caller.trace_id());
        assert_eq!(payload.transaction_id(), Some(caller.id()));
        assert_eq!(payload.sampled(), Some(true));
        assert!(payload.priority().unwrap() >= 1.0);
        assert_eq!(payload.trusted_account_key(), None);

        let encoded = payload.encode_http_safe().unwrap();
        let linked = f
            .service
            .accept(&callee, &encoded, TransportType::Https)
            .unwrap();
        assert_eq!(linked.trace_id, caller.trace_id());
        assert_eq!(callee.trace_id(), caller.trace_id());
        assert_eq!(linked.sampled, payload.sampled());
        assert_eq!(linked.priority, payload.priority());
        assert_eq!(linked.parent_span_id.as_deref(), payload.span_id());

        let parent = callee.trace_context().parent.unwrap();
        assert_eq!(parent.transport, TransportType::Https);
        assert_eq!(parent.account_id, "33");

        let snapshot = f.metrics.snapshot_and_reset();
        assert_eq!(count(&snapshot, DT_CREATE_SUCCESS_METRIC), 1);
        assert_eq!(count(&snapshot, DT_ACCEPT_SUCCESS_METRIC), 1);
    }

    #[test]
    fn test_accept_failures_are_counted() {
        let f = fixture(&config());
        let tx = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "callee")
            .unwrap();

        assert_eq!(
            f.service.accept(&tx, "", TransportType::Http).unwrap_err(),
            DistributedTraceError::Null
        );
        assert!(matches!(
            f.service.accept(&tx, "{nope", TransportType::Http),
            Err(DistributedTraceError::ParseError(_))
        ));
        let untrusted = r#"{"v":[0,1],"d":{"ty":"App","ac":"99","ap":"1","tr":"t","id":"s","ti":1}}"#;
        assert_eq!(
            f.service.accept(&tx, untrusted, TransportType::Http).unwrap_err(),
            DistributedTraceError::UntrustedAccount("99".to_string())
        );
        let future = r#"{"v":[2,0],"d":{}}"#;
        assert!(matches!(
            f.service.accept(&tx, future, TransportType::Http),
            Err(DistributedTraceError::UnsupportedVersion { major: 2, .. })
        ));
        assert!(tx.trace_context().parent.is_none());
        assert_eq!(tx.trace_id(), tx.id());

        let snapshot = f.metrics.snapshot_and_reset();
        assert_eq!(
            count(&snapshot, DistributedTraceError::Null.accept_metric()),
            1
        );
        assert_eq!(
            count(
                &snapshot,
                "Supportability/DistributedTrace/AcceptPayload/ParseException"
            ),
            1
        );
        assert_eq!(
            count(
                &snapshot,
                "Supportability/DistributedTrace/AcceptPayload/Ignored/UntrustedAccount"
            ),
            1
        );
        assert_eq!(
            count(
                &snapshot,
                "Supportability/DistributedTrace/AcceptPayload/Ignored/MajorVersion"
            ),
            1
        );
    }

    #[test]
    fn test_trusted_key_in_payload_overrides_account() {
        let f = fixture(&config());
        let tx = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "callee")
            .unwrap();
        let payload = r#"{"v":[0,1],"d":{"ty":"Browser","ac":"99","ap":"1","tk":"33","tr":"t","tx":"x","sa":false,"pr":0.25,"ti":1}}"#;

        let linked = f.service.accept(&tx, payload, TransportType::Http).unwrap();
        assert_eq!(linked.trace_id, "t");
        assert_eq!(linked.sampled, Some(false));
        assert_eq!(linked.priority, Some(0.25));
        assert_eq!(linked.parent_span_id, None);
    }

    #[test]
    fn test_accept_only_once() {
        let f = fixture(&config());
        let caller = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "caller")
            .unwrap();
        let callee = f
            .registry
            .begin(ContextId(2), TransactionKind::Web, "callee")
            .unwrap();
        let encoded = f.service.create(&caller).unwrap().to_json().unwrap();

        assert!(f.service.accept(&callee, &encoded, TransportType::Http).is_ok());
        assert_eq!(
            f.service
                .accept(&callee, &encoded, TransportType::Http)
                .unwrap_err(),
            DistributedTraceError::AlreadyAccepted
        );
    }

    #[test]
    fn test_accept_after_create_is_rejected() {
        let f = fixture(&config());
        let caller = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "caller")
            .unwrap();
        let tx = f
            .registry
            .begin(ContextId(2), TransactionKind::Web, "callee")
            .unwrap();
        let inbound = f.service.create(&caller).unwrap().to_json().unwrap();

        f.service.create(&tx).unwrap();
        assert_eq!(
            f.service.accept(&tx, &inbound, TransportType::Http).unwrap_err(),
            DistributedTraceError::AcceptAfterCreate
        );
    }

    #[test]
    fn test_inactive_transaction() {
        let f = fixture(&config());
        let tx = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "done")
            .unwrap();
        f.registry.end(&tx);

        assert_eq!(
            f.service.create(&tx).unwrap_err(),
            DistributedTraceError::InactiveTransaction
        );
        assert_eq!(
            count(&f.metrics.snapshot_and_reset(), DT_CREATE_EXCEPTION_METRIC),
            1
        );
    }

    #[test]
    fn test_disabled() {
        let f = fixture(&Config {
            distributed_tracing_enabled: false,
            ..config()
        });
        let tx = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "tx")
            .unwrap();

        assert!(!f.service.is_enabled());
        assert_eq!(
            f.service.create(&tx).unwrap_err(),
            DistributedTraceError::Disabled
        );
        assert_eq!(
            f.service.accept(&tx, "x", TransportType::Http).unwrap_err(),
            DistributedTraceError::Disabled
        );
    }

    #[test]
    fn test_inject_and_extract_through_headers() {
        let f = fixture(&config());
        let caller = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "caller")
            .unwrap();
        let callee = f
            .registry
            .begin(ContextId(2), TransactionKind::Other, "consumer")
            .unwrap();

        let mut headers: HashMap<String, String> = HashMap::new();
        f.service.inject(&caller, &mut headers).unwrap();
        assert!(headers.contains_key(PAYLOAD_HEADER));

        let linked = f
            .service
            .extract(&callee, &headers, TransportType::Kafka)
            .unwrap();
        assert_eq!(linked.trace_id, caller.trace_id());
    }

    #[test]
    fn test_inject_counts_one_create_success() {
        let f = fixture(&config());
        let caller = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "caller")
            .unwrap();
        let mut headers: HashMap<String, String> = HashMap::new();
        f.service.inject(&caller, &mut headers).unwrap();

        let snapshot = f.metrics.snapshot_and_reset();
        assert_eq!(count(&snapshot, DT_CREATE_SUCCESS_METRIC), 1);
        assert_eq!(count(&snapshot, DT_CREATE_EXCEPTION_METRIC), 0);
    }

    #[test]
    fn test_failed_encoding_counts_as_create_exception() {
        let f = fixture(&config());
        let caller = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "caller")
            .unwrap();

        let result = f.service.counted_create(&caller, |_| {
            Err::<String, _>(DistributedTraceError::EncodeError("invalid".to_string()))
        });
        assert!(matches!(result, Err(DistributedTraceError::EncodeError(_))));

        let snapshot = f.metrics.snapshot_and_reset();
        assert_eq!(count(&snapshot, DT_CREATE_SUCCESS_METRIC), 0);
        assert_eq!(count(&snapshot, DT_CREATE_EXCEPTION_METRIC), 1);
        assert_eq!(count(&snapshot, DT_ACCEPT_PARSE_EXCEPTION_METRIC), 0);
    }

    #[test]
    fn test_each_payload_names_its_own_outbound_span() {
        let f = fixture(&config());
        let caller = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "caller")
            .unwrap();

        let first = f.service.create(&caller).unwrap();
        let second = f.service.create(&caller).unwrap();
        assert_eq!(first.transaction_id(), second.transaction_id());
        assert_eq!(first.trace_id(), second.trace_id());
        assert_eq!(first.span_id().map(str::len), Some(16));
        assert_ne!(first.span_id(), second.span_id());
    }

    #[test]
    fn test_extract_without_header_is_null() {
        let f = fixture(&config());
        let tx = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "tx")
            .unwrap();
        let headers: HashMap<String, String> = HashMap::new();

        assert_eq!(
            f.service
                .extract(&tx, &headers, TransportType::Http)
                .unwrap_err(),
            DistributedTraceError::Null
        );
    }

    #[test]
    fn test_linked_transaction_records_duration_by_caller() {
        let f = fixture(&config());
        let caller = f
            .registry
            .begin(ContextId(1), TransactionKind::Web, "caller")
            .unwrap();
        let callee = f
            .registry
            .begin(ContextId(2), TransactionKind::Web, "callee")
            .unwrap();
        let payload = f.service.create(&caller).unwrap().to_json().unwrap();
        f.service
            .accept(&callee, &payload, TransportType::Https)
            .unwrap();

        f.registry.end(&callee);
        let snapshot = f.metrics.snapshot_and_reset();
        assert_eq!(
            count(&snapshot, "DurationByCaller/App/33/5043/HTTPS/all"),
            1
        );
    }
}
