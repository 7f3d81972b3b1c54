//! Public agent API.
//!
//! Every method increments its `Supportability/ApiInvocation/<Name>` counter
//! before doing anything else, so calls are counted whether or not they
//! succeed. Nothing here panics into the caller; failures come back as
//! `false`, `None`, an empty string or a typed error.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use apm_metrics::double_buffered_aggregator::DoubleBufferedAggregator;
use apm_metrics::metric::MetricKind;
use apm_metrics::supportability::{ApiMethod, ApiSupportabilityCounters};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::custom_event::{CustomEvent, CustomEventBuffer};
use crate::distributed_trace::error::DistributedTraceError;
use crate::distributed_trace::{DistributedTraceService, Linked, TransportType};
use crate::transaction::registry::ERRORS_ALL_METRIC;
use crate::transaction::{AttributeValue, ContextId, NoticedError, TransactionHandle, TransactionRegistry};

pub const USER_ATTRIBUTE: &str = "user";
pub const ACCOUNT_ATTRIBUTE: &str = "account";
pub const PRODUCT_ATTRIBUTE: &str = "product";

const BROWSER_HEADER: &str = "<script type=\"text/javascript\">window.NREUM||(NREUM={});NREUM.init={start:Date.now()};</script>";

/// Page data the browser footer hands to the timing script.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BrowserInfo<'a> {
    application_id: &'a str,
    application_name: &'a str,
    transaction_name: String,
    application_time: u64,
}

#[derive(Clone)]
pub struct AgentApi {
    registry: Arc<TransactionRegistry>,
    distributed_trace: Arc<DistributedTraceService>,
    metrics: Arc<DoubleBufferedAggregator>,
    supportability: Arc<ApiSupportabilityCounters>,
    custom_events: Arc<CustomEventBuffer>,
    app_name: Arc<RwLock<String>>,
    application_id: String,
}

impl AgentApi {
    #[must_use]
    pub fn new(
        config: &Config,
        registry: Arc<TransactionRegistry>,
        distributed_trace: Arc<DistributedTraceService>,
        metrics: Arc<DoubleBufferedAggregator>,
        supportability: Arc<ApiSupportabilityCounters>,
        custom_events: Arc<CustomEventBuffer>,
    ) -> Self {
        Self {
            registry,
            distributed_trace,
            metrics,
            supportability,
            custom_events,
            app_name: Arc::new(RwLock::new(config.app_name.clone())),
            application_id: config.primary_application_id.clone(),
        }
    }

    fn invoked(&self, api: ApiMethod) {
        self.supportability.increment(api);
    }

    fn transaction(&self, context: ContextId, api: ApiMethod) -> Option<TransactionHandle> {
        let transaction = self.registry.current(context);
        if transaction.is_none() {
            debug!("{api} called outside of a transaction in context {context}");
        }
        transaction
    }

    #[must_use]
    pub fn current_transaction(&self, context: ContextId) -> Option<TransactionHandle> {
        self.invoked(ApiMethod::CurrentTransaction);
        self.registry.current(context)
    }

    pub fn add_custom_parameter(
        &self,
        context: ContextId,
        key: &str,
        value: impl Into<AttributeValue>,
    ) -> bool {
        self.invoked(ApiMethod::AddCustomParameter);
        self.transaction(context, ApiMethod::AddCustomParameter)
            .is_some_and(|transaction| transaction.add_attribute(key, value))
    }

    /// Renames the current transaction to `<category>/<name>`, or `<name>`
    /// when the category is empty.
    pub fn set_transaction_name(&self, context: ContextId, category: &str, name: &str) -> bool {
        self.invoked(ApiMethod::SetTransactionName);
        if name.is_empty() {
            debug!("Ignoring empty transaction name");
            return false;
        }
        let full_name = if category.is_empty() {
            name.to_string()
        } else {
            format!("{category}/{name}")
        };
        self.transaction(context, ApiMethod::SetTransactionName)
            .is_some_and(|transaction| transaction.set_name(&full_name))
    }

    pub fn ignore_transaction(&self, context: ContextId) -> bool {
        self.invoked(ApiMethod::IgnoreTransaction);
        self.transaction(context, ApiMethod::IgnoreTransaction)
            .map(|transaction| transaction.ignore())
            .is_some()
    }

    pub fn ignore_apdex(&self, context: ContextId) -> bool {
        self.invoked(ApiMethod::IgnoreApdex);
        self.transaction(context, ApiMethod::IgnoreApdex)
            .map(|transaction| transaction.ignore_apdex())
            .is_some()
    }

    /// Notices an error on the current transaction. Outside a transaction the
    /// error is only counted.
    pub fn notice_error(&self, context: ContextId, message: &str, error_type: &str) {
        self.invoked(ApiMethod::NoticeError);
        match self.registry.current(context) {
            Some(transaction) => {
                transaction.notice_error(NoticedError::new(message, error_type));
            }
            None => self.metrics.record_count(ERRORS_ALL_METRIC, 1),
        }
    }

    pub fn increment_counter(&self, name: &str) {
        self.invoked(ApiMethod::IncrementCounter);
        if name.is_empty() {
            debug!("Ignoring counter with an empty name");
            return;
        }
        self.metrics.record(name, 1.0, MetricKind::Count);
    }

    pub fn record_metric(&self, name: &str, value: f64) {
        self.invoked(ApiMethod::RecordMetric);
        if name.is_empty() || !value.is_finite() {
            debug!("Ignoring metric {name:?} with value {value}");
            return;
        }
        self.metrics.record(name, value, MetricKind::Count);
    }

    pub fn record_response_time_metric(&self, name: &str, millis: u64) {
        self.invoked(ApiMethod::RecordResponseTimeMetric);
        if name.is_empty() {
            debug!("Ignoring response time metric with an empty name");
            return;
        }
        let duration = Duration::from_millis(millis);
        self.metrics.record_timing(name, duration, duration);
    }

    pub fn set_user_parameters(
        &self,
        context: ContextId,
        user: &str,
        account: &str,
        product: &str,
    ) -> bool {
        self.invoked(ApiMethod::SetUserParameters);
        let Some(transaction) = self.transaction(context, ApiMethod::SetUserParameters) else {
            return false;
        };
        [
            (USER_ATTRIBUTE, user),
            (ACCOUNT_ATTRIBUTE, account),
            (PRODUCT_ATTRIBUTE, product),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .fold(true, |all, (key, value)| transaction.add_attribute(key, value) && all)
    }

    /// Base64 payload for an outbound call, or `None` when none can be
    /// created.
    #[must_use]
    pub fn create_distributed_trace_payload(&self, context: ContextId) -> Option<String> {
        self.invoked(ApiMethod::CreateDistributedTracePayload);
        let transaction = self.transaction(context, ApiMethod::CreateDistributedTracePayload)?;
        self.distributed_trace.create_http_safe(&transaction).ok()
    }

    pub fn accept_distributed_trace_payload(
        &self,
        context: ContextId,
        payload: &str,
        transport: TransportType,
    ) -> Result<Linked, DistributedTraceError> {
        self.invoked(ApiMethod::AcceptDistributedTracePayload);
        let transaction = self
            .transaction(context, ApiMethod::AcceptDistributedTracePayload)
            .ok_or(DistributedTraceError::InactiveTransaction)?;
        self.distributed_trace.accept(&transaction, payload, transport)
    }

    pub fn disable_browser_monitoring(&self, context: ContextId) -> bool {
        self.invoked(ApiMethod::DisableBrowserMonitoring);
        self.transaction(context, ApiMethod::DisableBrowserMonitoring)
            .map(|transaction| transaction.disable_browser_monitoring())
            .is_some()
    }

    /// Script for the top of the page, or an empty string when the
    /// transaction is not monitored by the browser.
    #[must_use]
    pub fn get_browser_timing_header(&self, context: ContextId) -> String {
        self.invoked(ApiMethod::GetBrowserTimingHeader);
        self.browser_transaction(context, ApiMethod::GetBrowserTimingHeader)
            .map_or_else(String::new, |_| BROWSER_HEADER.to_string())
    }

    /// Script for the bottom of the page carrying the transaction name and
    /// the application time spent so far.
    #[must_use]
    pub fn get_browser_timing_footer(&self, context: ContextId) -> String {
        self.invoked(ApiMethod::GetBrowserTimingFooter);
        let Some(transaction) =
            self.browser_transaction(context, ApiMethod::GetBrowserTimingFooter)
        else {
            return String::new();
        };
        let app_name = self.application_name();
        let info = BrowserInfo {
            application_id: &self.application_id,
            application_name: &app_name,
            transaction_name: transaction.metric_name(),
            application_time: u64::try_from(transaction.elapsed().as_millis())
                .unwrap_or(u64::MAX),
        };
        match serde_json::to_string(&info) {
            Ok(json) => format!(
                "<script type=\"text/javascript\">window.NREUM||(NREUM={{}});NREUM.info={json};</script>"
            ),
            Err(e) => {
                debug!("Cannot serialize browser timing footer: {e}");
                String::new()
            }
        }
    }

    fn browser_transaction(&self, context: ContextId, api: ApiMethod) -> Option<TransactionHandle> {
        self.transaction(context, api).filter(|transaction| {
            transaction.is_active()
                && !transaction.is_ignored()
                && !transaction.is_browser_monitoring_disabled()
        })
    }

    /// Buffers a custom event. Returns `false` when the event is invalid or
    /// the buffer is full.
    pub fn record_custom_event(
        &self,
        event_type: &str,
        attributes: BTreeMap<String, AttributeValue>,
    ) -> bool {
        self.invoked(ApiMethod::RecordCustomEvent);
        match CustomEvent::new(event_type, attributes) {
            Ok(event) => self.custom_events.add(event),
            Err(e) => {
                debug!("Ignoring custom event: {e}");
                false
            }
        }
    }

    /// Renames the application reported from now on.
    pub fn set_application_name(&self, name: &str) -> bool {
        self.invoked(ApiMethod::SetApplicationName);
        let name = name.trim();
        if name.is_empty() {
            debug!("Ignoring empty application name");
            return false;
        }
        let mut app_name = self.app_name.write().unwrap_or_else(PoisonError::into_inner);
        info!("Application name changed from {} to {name}", *app_name);
        *app_name = name.to_string();
        true
    }

    #[must_use]
    pub fn application_name(&self) -> String {
        self.app_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
