use std::sync::{Arc, Mutex};
use std::thread;

use apm_agent::agent::Agent;
use apm_agent::config::env::{ACCOUNT_ID_VAR, HARVEST_INTERVAL_SECS_VAR, PRIMARY_APPLICATION_ID_VAR};
use apm_agent::config::{get_config, Config};
use apm_agent::distributed_trace::error::DistributedTraceError;
use apm_agent::distributed_trace::TransportType;
use apm_agent::transaction::{ContextId, TransactionKind, TransactionStatus};
use apm_metrics::constants::{DT_ACCEPT_IGNORED_MAJOR_VERSION_METRIC, DT_ACCEPT_SUCCESS_METRIC};
use apm_metrics::harvest::{HarvestOutcome, HarvestReport, ReportError, Reporter};
use apm_metrics::supportability::ApiMethod;
use async_trait::async_trait;

#[derive(Default)]
struct CollectorStub {
    reports: Mutex<Vec<HarvestReport>>,
}

#[async_trait]
impl Reporter for CollectorStub {
    async fn send(&self, report: &HarvestReport) -> Result<(), ReportError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

fn linked_config() -> Config {
    Config {
        account_id: "33".to_string(),
        primary_application_id: "5043".to_string(),
        trusted_account_key: "33".to_string(),
        ..Config::default()
    }
}

#[cfg(test)]
#[tokio::test]
async fn instrumented_request_reports_transaction_and_segments() {
    let mut agent = Agent::new(Config::default()).unwrap();
    let collector = Arc::new(CollectorStub::default());
    agent.start(collector.clone()).unwrap();

    let context = ContextId(7);
    let events = agent.events();
    events.on_enter("handleRequest", context);
    events.on_enter("db.query", context);
    events.on_exit(context, None);
    events.on_enter("render", context);
    events.on_enter("template", context);
    events.on_exit(context, None);
    events.on_exit(context, None);
    assert_eq!(events.depth(context), 1);
    events.on_exit(context, None);

    assert_eq!(events.depth(context), 0);
    assert!(agent.registry().current(context).is_none());

    assert!(matches!(
        agent.harvest_now().await,
        Some(HarvestOutcome::Sent { .. })
    ));
    {
        let reports = collector.reports.lock().unwrap();
        let metrics = &reports[0].metrics;
        assert_eq!(metrics.get("WebTransaction/handleRequest").unwrap().count, 1);
        assert_eq!(metrics.get("WebTransaction").unwrap().count, 1);
        assert!(metrics.get("Segment/handleRequest").is_none());
        for segment in ["Segment/db.query", "Segment/render", "Segment/template"] {
            assert_eq!(metrics.get(segment).unwrap().count, 1, "{segment}");
        }
        let render = metrics.get("Segment/render").unwrap();
        assert!(render.exclusive <= render.total);
    }

    agent.shutdown().await;
}

#[cfg(test)]
#[tokio::test]
async fn payload_links_caller_and_callee_transactions() {
    let mut agent = Agent::new(linked_config()).unwrap();
    let collector = Arc::new(CollectorStub::default());
    agent.start(collector.clone()).unwrap();

    let caller = ContextId(1);
    let callee = ContextId(2);
    let registry = Arc::clone(agent.registry());
    let outbound = registry
        .begin(caller, TransactionKind::Web, "frontend")
        .unwrap();
    let inbound = registry
        .begin(callee, TransactionKind::Web, "backend")
        .unwrap();

    let payload = agent.api().create_distributed_trace_payload(caller).unwrap();
    let linked = agent
        .api()
        .accept_distributed_trace_payload(callee, &payload, TransportType::Https)
        .unwrap();

    assert_eq!(linked.trace_id, outbound.trace_id());
    assert_eq!(inbound.trace_id(), outbound.trace_id());
    assert_eq!(linked.parent_transaction_id.as_deref(), Some(outbound.id()));
    assert_eq!(linked.sampled, outbound.trace_context().sampled);

    assert!(agent
        .api()
        .accept_distributed_trace_payload(callee, &payload, TransportType::Https)
        .is_err());

    registry.end(&inbound);
    registry.end(&outbound);
    agent.shutdown().await;

    let reports = collector.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report
        .metrics
        .get("DurationByCaller/App/33/5043/HTTPS/all")
        .is_some());
    assert_eq!(report.metrics.get(DT_ACCEPT_SUCCESS_METRIC).unwrap().count, 1);
    assert_eq!(
        report
            .supportability
            .get(ApiMethod::AcceptDistributedTracePayload.metric_name())
            .unwrap()
            .count,
        2
    );
}

#[cfg(test)]
#[tokio::test]
async fn fan_out_segments_attach_to_one_transaction() {
    const WORKERS: usize = 8;
    const SEGMENTS_PER_WORKER: usize = 50;

    let mut agent = Agent::new(Config::default()).unwrap();
    let collector = Arc::new(CollectorStub::default());
    agent.start(collector.clone()).unwrap();

    let transaction = agent
        .registry()
        .begin(ContextId(3), TransactionKind::Other, "batch")
        .unwrap();
    let fan_out = transaction.start_segment("fan-out");

    thread::scope(|scope| {
        for _ in 0..WORKERS {
            scope.spawn(|| {
                for _ in 0..SEGMENTS_PER_WORKER {
                    let segment = fan_out.start_child("work");
                    assert!(!segment.is_inert());
                    segment.end();
                }
            });
        }
    });
    fan_out.end();

    assert_eq!(
        transaction.segment_count(),
        2 + WORKERS * SEGMENTS_PER_WORKER
    );
    assert!(agent.registry().end(&transaction));
    assert_eq!(transaction.status(), TransactionStatus::Ended);

    agent.shutdown().await;
    let reports = collector.reports.lock().unwrap();
    let metrics = &reports[0].metrics;
    assert_eq!(metrics.get("OtherTransaction/batch").unwrap().count, 1);
    assert_eq!(metrics.get("OtherTransaction/all").unwrap().count, 1);
    assert_eq!(
        metrics.get("Segment/work").unwrap().count,
        (WORKERS * SEGMENTS_PER_WORKER) as u64
    );
}

#[cfg(test)]
#[tokio::test]
async fn agent_built_from_environment_harvests_on_shutdown() {
    let mut config = Config::default();
    figment::Jail::expect_with(|jail| {
        jail.clear_env();
        jail.set_env(ACCOUNT_ID_VAR, "33");
        jail.set_env(PRIMARY_APPLICATION_ID_VAR, "5043");
        jail.set_env(HARVEST_INTERVAL_SECS_VAR, "3600");
        config = get_config();
        Ok(())
    });
    assert_eq!(config.trusted_account_key, "33");
    assert_eq!(config.primary_application_id, "5043");

    let mut agent = Agent::new(config).unwrap();
    let collector = Arc::new(CollectorStub::default());
    agent.start(collector.clone()).unwrap();

    agent.api().record_metric("fred", 1.0);
    agent.api().record_metric("fred", 1.0);
    agent.api().notice_error(ContextId(9), "boom", "RuntimeError");

    let handle = agent.handle();
    handle.shutdown();
    agent.shutdown().await;

    let reports = collector.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.metrics.get("fred").unwrap().count, 2);
    assert_eq!(report.metrics.get("Errors/all").unwrap().count, 1);
    let recorded = report
        .supportability
        .get(ApiMethod::RecordMetric.metric_name())
        .unwrap();
    assert_eq!(recorded.count, 2);
    assert_eq!(
        report
            .supportability
            .get(ApiMethod::StartAgent.metric_name())
            .unwrap()
            .count,
        1
    );
}

#[cfg(test)]
#[tokio::test]
async fn api_invocation_is_counted_once_per_call() {
    let mut agent = Agent::new(Config::default()).unwrap();
    let collector = Arc::new(CollectorStub::default());
    agent.start(collector.clone()).unwrap();

    let context = ContextId(4);
    agent.events().on_enter("checkout", context);
    assert!(agent.api().add_custom_parameter(context, "cart", 3));
    agent.events().on_exit(context, None);

    agent.shutdown().await;
    let reports = collector.reports.lock().unwrap();
    let report = &reports[0];
    assert_eq!(
        report
            .supportability
            .get("Supportability/ApiInvocation/AddCustomParameter")
            .unwrap()
            .count,
        1
    );
    assert_eq!(report.metrics.get("WebTransaction/checkout").unwrap().count, 1);
}

#[cfg(test)]
#[tokio::test]
async fn unsupported_payload_version_leaves_transaction_unlinked() {
    let agent = Agent::new(linked_config()).unwrap();
    let context = ContextId(5);
    let transaction = agent
        .registry()
        .begin(context, TransactionKind::Web, "backend")
        .unwrap();
    let own_trace_id = transaction.trace_id();

    let payload = r#"{"v":[1,0],"d":{"ty":"App","ac":"33","ap":"5043","tr":"abc","id":"def","ti":1482959525577}}"#;
    let result = agent
        .api()
        .accept_distributed_trace_payload(context, payload, TransportType::Http);

    assert!(matches!(
        result,
        Err(DistributedTraceError::UnsupportedVersion { major: 1, .. })
    ));
    assert_eq!(transaction.trace_id(), own_trace_id);
    assert!(transaction.trace_context().parent.is_none());
    assert_eq!(
        agent
            .metrics()
            .snapshot_and_reset()
            .get(DT_ACCEPT_IGNORED_MAJOR_VERSION_METRIC)
            .unwrap()
            .count,
        1
    );
}
