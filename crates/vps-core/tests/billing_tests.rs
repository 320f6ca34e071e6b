mod common;

use chrono::{Duration, Utc};
use common::Harness;
use vps_core::*;
use vps_runtime::mock::Op;

#[tokio::test]
async fn test_not_due_before_interval() {
    let h = Harness::new();
    let id = h.create("alice").await;
    h.fund("alice", 500.0).await;

    let outcome = h
        .host
        .billing()
        .process_instance(&id, Utc::now() + Duration::days(29))
        .await
        .unwrap();
    assert_eq!(outcome, BillingOutcome::NotDue);
    assert_eq!(h.ledger.balance("alice").await.unwrap(), 500.0);
}

#[tokio::test]
async fn test_due_instance_with_funds_is_charged() {
    let h = Harness::new();
    let id = h.create("alice").await;
    h.fund("alice", 500.0).await;

    let now = Utc::now() + Duration::days(31);
    let report = h.host.billing().scan_at(now).await;
    assert_eq!(
        report.outcomes,
        vec![(id.clone(), BillingOutcome::Charged { amount: 95.0 })]
    );

    let record = h.host.get(&id).await.unwrap();
    assert_eq!(record.last_billed_at, now);
    assert!(!record.payment_overdue);
    assert_eq!(h.ledger.balance("alice").await.unwrap(), 405.0);

    let sent = h.notifier.for_user("alice");
    assert!(matches!(
        sent.as_slice(),
        [Notification::BillingSucceeded { amount, .. }] if *amount == 95.0
    ));
}

#[tokio::test]
async fn test_overdue_grace_then_suspension() {
    let h = Harness::new();
    let id = h.create("alice").await;
    h.fund("alice", 10.0).await;
    let billing = h.host.billing();

    let now = Utc::now() + Duration::days(31);
    assert_eq!(
        billing.process_instance(&id, now).await.unwrap(),
        BillingOutcome::MarkedOverdue { amount: 95.0 }
    );
    let record = h.host.get(&id).await.unwrap();
    assert!(record.payment_overdue);
    assert_eq!(record.grace_period_end, Some(now + Duration::days(3)));
    assert!(matches!(
        h.notifier.for_user("alice").as_slice(),
        [Notification::InsufficientFunds { balance, .. }] if *balance == 10.0
    ));

    // Two days in: still overdue, grace end unchanged, still running
    assert_eq!(
        billing
            .process_instance(&id, now + Duration::days(2))
            .await
            .unwrap(),
        BillingOutcome::StillOverdue
    );
    let record = h.host.get(&id).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Running);
    assert_eq!(record.grace_period_end, Some(now + Duration::days(3)));

    // Four days in: suspended and stopped
    let later = now + Duration::days(4);
    assert_eq!(
        billing.process_instance(&id, later).await.unwrap(),
        BillingOutcome::Suspended
    );
    let record = h.host.get(&id).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Suspended);
    assert_eq!(record.suspended_at, Some(later));
    assert!(!h.runtime.is_running(&record.container_id));
    assert!(matches!(
        h.notifier.for_user("alice").last(),
        Some(Notification::Suspended { .. })
    ));

    // Suspension is terminal
    assert_eq!(
        billing
            .process_instance(&id, later + Duration::days(30))
            .await
            .unwrap(),
        BillingOutcome::AlreadySuspended
    );
    assert!(matches!(h.host.start(&id).await, Err(VpsError::Suspended(_))));
}

#[tokio::test]
async fn test_payment_during_grace_recovers() {
    let h = Harness::new();
    let id = h.create("alice").await;
    let billing = h.host.billing();

    let now = Utc::now() + Duration::days(31);
    billing.process_instance(&id, now).await.unwrap();
    h.fund("alice", 100.0).await;

    let paid_at = now + Duration::days(1);
    assert_eq!(
        billing.process_instance(&id, paid_at).await.unwrap(),
        BillingOutcome::Recovered { amount: 95.0 }
    );
    let record = h.host.get(&id).await.unwrap();
    assert!(!record.payment_overdue);
    assert!(record.grace_period_end.is_none());
    assert_eq!(record.last_billed_at, paid_at);
    assert_eq!(h.ledger.balance("alice").await.unwrap(), 5.0);
}

#[tokio::test]
async fn test_ledger_outage_counts_as_failed_payment() {
    let h = Harness::new();
    let id = h.create("alice").await;
    h.fund("alice", 500.0).await;
    h.ledger.set_unavailable(true);

    let now = Utc::now() + Duration::days(31);
    assert_eq!(
        h.host.billing().process_instance(&id, now).await.unwrap(),
        BillingOutcome::MarkedOverdue { amount: 95.0 }
    );
    assert!(h.host.get(&id).await.unwrap().payment_overdue);
    assert!(matches!(
        h.notifier.for_user("alice").as_slice(),
        [Notification::PaymentFailed { .. }]
    ));
}

#[tokio::test]
async fn test_notification_failure_keeps_billing_state() {
    let h = Harness::new();
    let id = h.create("alice").await;
    h.notifier.set_unreachable(true);

    let now = Utc::now() + Duration::days(31);
    h.host.billing().process_instance(&id, now).await.unwrap();
    assert!(h.host.get(&id).await.unwrap().payment_overdue);
    assert!(h.notifier.delivered().is_empty());
}

#[tokio::test]
async fn test_unsaved_charge_is_refunded() {
    let h = Harness::new();
    let id = h.create("alice").await;
    h.fund("alice", 200.0).await;

    h.store.fail_next_saves(1);
    let now = Utc::now() + Duration::days(31);
    let result = h.host.billing().process_instance(&id, now).await;
    assert!(matches!(result, Err(VpsError::Persistence(_))));
    assert_eq!(h.ledger.balance("alice").await.unwrap(), 200.0);
    assert!(!h.host.get(&id).await.unwrap().payment_overdue);

    // The next scan bills normally
    assert_eq!(
        h.host.billing().process_instance(&id, now).await.unwrap(),
        BillingOutcome::Charged { amount: 95.0 }
    );
    assert_eq!(h.ledger.balance("alice").await.unwrap(), 105.0);
}

#[tokio::test]
async fn test_failed_suspension_is_retried_next_scan() {
    let h = Harness::new();
    let id = h.create("alice").await;
    let billing = h.host.billing();

    let now = Utc::now() + Duration::days(31);
    billing.process_instance(&id, now).await.unwrap();

    h.runtime.fail_next(Op::Stop, 1);
    let report = billing.scan_at(now + Duration::days(4)).await;
    assert_eq!(report.errors.len(), 1);
    assert_ne!(h.host.get(&id).await.unwrap().status, InstanceStatus::Suspended);

    let report = billing.scan_at(now + Duration::days(4)).await;
    assert_eq!(report.count(|o| *o == BillingOutcome::Suspended), 1);
}

#[tokio::test]
async fn test_scan_isolates_instances() {
    let h = Harness::new();
    let rich = h.create("alice").await;
    let poor = h.create("bob").await;
    h.fund("alice", 500.0).await;

    let report = h.host.billing().scan_at(Utc::now() + Duration::days(31)).await;
    assert!(report.errors.is_empty());
    assert!(report
        .outcomes
        .contains(&(rich, BillingOutcome::Charged { amount: 95.0 })));
    assert!(report
        .outcomes
        .contains(&(poor, BillingOutcome::MarkedOverdue { amount: 95.0 })));
}

#[tokio::test]
async fn test_undrained_notification_channel_does_not_stall_scan() {
    let runtime = vps_runtime::mock::MockRuntime::new();
    let runtime_dyn: std::sync::Arc<dyn vps_runtime::ContainerRuntime> =
        std::sync::Arc::new(runtime);
    let ledger = std::sync::Arc::new(InMemoryLedger::new());
    let (notifier, _rx) = ChannelNotifier::channel(1);
    let host = VpsHost::new(
        VpsConfig::default(),
        Collaborators {
            runtime: runtime_dyn.clone(),
            disk: std::sync::Arc::new(DfProbe::new(runtime_dyn)),
            registry_store: std::sync::Arc::new(MemoryStore::new()),
            stats_store: std::sync::Arc::new(InMemoryStatsStore::new()),
            ledger: ledger.clone(),
            notifier: std::sync::Arc::new(notifier),
        },
    );

    let config = common::small_config();
    let first = host.create("alice", config.clone()).await.unwrap();
    let second = host.create("bob", config.clone()).await.unwrap();
    let third = host.create("carol", config).await.unwrap();
    ledger.credit("alice", 500.0, "deposit").await.unwrap();

    let now = Utc::now() + Duration::days(31);
    let report = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        host.billing().scan_at(now),
    )
    .await
    .expect("scan must not wait on the notification channel");
    assert!(report.errors.is_empty());
    assert_eq!(report.outcomes.len(), 3);

    // State changed even though most notifications were dropped
    assert!(!host.get(&first).await.unwrap().payment_overdue);
    assert!(host.get(&second).await.unwrap().payment_overdue);
    assert!(host.get(&third).await.unwrap().payment_overdue);
    assert!(host.controller().locks().is_empty());
}

#[tokio::test]
async fn test_instance_deleted_mid_scan_is_skipped() {
    let h = Harness::new();
    let gone = h.create("alice").await;
    let kept = h.create("bob").await;

    // Hold the instance so the scan lists it, then finds it gone
    let guard = h.host.controller().locks().acquire(&gone).await;
    let scan = {
        let host = h.host.clone();
        tokio::spawn(async move { host.billing().scan_at(Utc::now() + Duration::days(31)).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.host.registry().remove(&gone).await.unwrap();
    drop(guard);

    let report = scan.await.unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(
        report.outcomes,
        vec![(kept, BillingOutcome::MarkedOverdue { amount: 95.0 })]
    );
}
