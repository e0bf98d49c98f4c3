//! End-to-end metering tests
//!
//! Drives the lifecycle service with the collector attached and the
//! in-process billing client feeding a real aggregator.

use super::*;
use crate::lifecycle::{RequestContext, VmService};
use crate::models::SummaryKind;
use crate::repository::InMemoryVmRepository;
use crate::test_support::{sample, valid_vm_config, MockBackend};
use std::sync::Arc;
use std::time::Duration;

struct Pipeline {
    backend: Arc<MockBackend>,
    aggregator: Arc<UsageAggregator>,
    collector: Arc<MetricsCollector>,
    service: VmService,
    summaries: tokio::sync::mpsc::Receiver<crate::models::UsageSummary>,
}

fn pipeline() -> Pipeline {
    let backend = Arc::new(MockBackend::new());
    let (aggregator, summaries) = UsageAggregator::new(Duration::from_secs(60), 32);
    let aggregator = Arc::new(aggregator);
    let billing = Arc::new(AggregatorBillingClient::new(aggregator.clone()));
    let collector = Arc::new(MetricsCollector::new(
        backend.clone(),
        billing,
        CollectorConfig {
            batch_size: 1,
            ..Default::default()
        },
    ));
    let service = VmService::new(backend.clone(), Arc::new(InMemoryVmRepository::new()))
        .with_collection(collector.clone());

    Pipeline {
        backend,
        aggregator,
        collector,
        service,
        summaries,
    }
}

#[tokio::test]
async fn test_vm_lifetime_produces_one_final_summary() {
    let mut p = pipeline();
    let ctx = RequestContext::for_customer("cust-1");

    let vm_id = p.service.create_vm(&ctx, valid_vm_config()).await.unwrap().vm_id;
    p.service.boot_vm(&ctx, &vm_id).await.unwrap();
    assert_eq!(p.aggregator.active_vm_count(), 1);

    for (i, cpu) in [1_000_000_000u64, 2_000_000_000, 4_000_000_000].into_iter().enumerate() {
        p.backend
            .set_metrics(&vm_id, sample(i as i64, cpu, 256 * 1024 * 1024, 0, 0));
        p.collector.collect_once().await;
    }

    p.service.shutdown_vm(&ctx, &vm_id, false, 30).await.unwrap();

    let summary = p.summaries.try_recv().unwrap();
    assert_eq!(summary.kind, SummaryKind::Final);
    assert_eq!(summary.vm_id, vm_id);
    assert_eq!(summary.customer_id, "cust-1");
    assert_eq!(summary.sample_count, 3);
    assert_eq!(summary.total_cpu_time_nanos, 4_000_000_000);
    assert!(p.summaries.try_recv().is_err());

    assert_eq!(p.aggregator.active_vm_count(), 0);
    assert_eq!(p.aggregator.customer_vm_count("cust-1"), 0);
    assert!(!p.collector.is_collecting(&vm_id));
}

#[tokio::test]
async fn test_delete_of_running_vm_finalizes_usage() {
    let mut p = pipeline();
    let ctx = RequestContext::for_customer("cust-2");

    let vm_id = p.service.create_vm(&ctx, valid_vm_config()).await.unwrap().vm_id;
    p.service.boot_vm(&ctx, &vm_id).await.unwrap();
    p.backend.set_metrics(&vm_id, sample(0, 500, 1024, 10, 10));
    p.collector.collect_once().await;

    p.service.delete_vm(&ctx, &vm_id).await.unwrap();

    let summary = p.summaries.try_recv().unwrap();
    assert_eq!(summary.kind, SummaryKind::Final);
    assert_eq!(summary.sample_count, 1);
    assert_eq!(p.aggregator.active_vm_count(), 0);
}
