//! Receipt posting: completed purchases, restores and pending-purchase sync.

mod common;

use std::collections::HashSet;

use common::Harness;
use purchases_sync::RefreshOutcome;
use purchases_test_utils::fixtures::make_purchase;
use purchases_test_utils::{BillingUpdate, ProductKind, ReceiptFingerprint, SyncError, SyncEvent};

fn fingerprints(tokens: &[&str]) -> HashSet<ReceiptFingerprint> {
    tokens.iter().map(|t| ReceiptFingerprint::of_token(t)).collect()
}

#[tokio::test]
async fn test_completed_purchase_writes_snapshot_without_refetch() {
    let mut h = Harness::identified("alice");
    let purchase = make_purchase("tok-monthly", "monthly", ProductKind::Subscription);

    h.controller
        .handle_billing_update(BillingUpdate::PurchasesUpdated(vec![purchase]))
        .await;

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    let SyncEvent::Completed(snapshot) = &events[0] else {
        panic!("expected Completed, got {:?}", events[0]);
    };
    assert!(snapshot.is_entitled_to("pro"));
    assert_eq!(h.controller.cached_entitlements().as_ref(), Some(snapshot));
    assert!(!h.cache.is_snapshot_stale());

    let posted = h.backend.posted();
    assert_eq!(posted.len(), 1);
    assert!(!posted[0].is_restore, "identified users post plain purchases");
    assert_eq!(
        h.cache.ledger().get_reported_fingerprints().expect("read"),
        fingerprints(&["tok-monthly"])
    );

    // The post response counts as a refresh.
    assert_eq!(h.controller.refresh_if_needed().await, RefreshOutcome::Throttled);
    assert_eq!(h.backend.fetch_calls(), 0);
}

#[tokio::test]
async fn test_anonymous_purchases_post_as_restore() {
    let h = Harness::new();
    assert!(h.controller.is_anonymous());

    h.controller
        .handle_billing_update(BillingUpdate::PurchasesUpdated(vec![make_purchase(
            "tok",
            "lifetime",
            ProductKind::InApp,
        )]))
        .await;

    let posted = h.backend.posted();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].is_restore);
    assert_eq!(posted[0].app_user_id, h.controller.app_user_id());
}

#[tokio::test]
async fn test_failed_post_is_reported_and_not_marked() {
    let mut h = Harness::identified("alice");
    h.backend.fail_post_for("tok-bad");

    h.controller
        .handle_billing_update(BillingUpdate::PurchasesUpdated(vec![
            make_purchase("tok-bad", "monthly", ProductKind::Subscription),
            make_purchase("tok-good", "annual", ProductKind::Subscription),
        ]))
        .await;

    let events = h.drain_events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], SyncEvent::Failed(SyncError::Backend(_))));
    assert!(matches!(events[1], SyncEvent::Completed(_)));
    assert_eq!(
        h.cache.ledger().get_reported_fingerprints().expect("read"),
        fingerprints(&["tok-good"])
    );
}

#[tokio::test]
async fn test_billing_failure_emits_failed() {
    let mut h = Harness::identified("alice");
    h.controller
        .handle_billing_update(BillingUpdate::PurchaseFailed {
            code: 1,
            message: "user cancelled".to_string(),
        })
        .await;

    assert_eq!(
        h.drain_events(),
        vec![SyncEvent::Failed(SyncError::Billing {
            code: 1,
            message: "user cancelled".to_string(),
        })]
    );
    assert!(h.backend.posted().is_empty());
}

#[tokio::test]
async fn test_restore_posts_history_of_both_kinds() {
    let mut h = Harness::identified("alice");
    h.billing.set_history(
        ProductKind::Subscription,
        vec![make_purchase("sub-old", "monthly", ProductKind::Subscription)],
    );
    h.billing.set_history(
        ProductKind::InApp,
        vec![make_purchase("inapp-old", "lifetime", ProductKind::InApp)],
    );

    let snapshot = h.controller.restore_purchases().await.expect("restore succeeds");
    assert!(snapshot.is_entitled_to("pro"));

    let posted = h.backend.posted();
    assert_eq!(posted.len(), 2);
    assert!(posted.iter().all(|p| p.is_restore));

    let events = h.drain_events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| matches!(e, SyncEvent::Updated(_))));
}

#[tokio::test]
async fn test_restore_without_history_fetches() {
    let mut h = Harness::identified("alice");
    let snapshot = h.controller.restore_purchases().await.expect("restore succeeds");
    assert_eq!(snapshot.app_user_id, h.controller.app_user_id());
    assert_eq!(h.backend.fetch_calls(), 1);
    assert_eq!(h.drain_events(), vec![SyncEvent::Updated(snapshot)]);
}

#[tokio::test]
async fn test_restore_reports_billing_failure() {
    let mut h = Harness::identified("alice");
    let error = SyncError::Billing {
        code: 3,
        message: "billing unavailable".to_string(),
    };
    h.billing.fail_with(error.clone());

    assert_eq!(h.controller.restore_purchases().await, Err(error.clone()));
    assert_eq!(
        h.drain_events(),
        vec![SyncEvent::Failed(error.clone()), SyncEvent::Failed(error)],
        "each history query reports its own failure"
    );
}

#[tokio::test]
async fn test_restore_continues_past_failed_subscription_query() {
    let mut h = Harness::identified("alice");
    let error = SyncError::Billing {
        code: 6,
        message: "subscriptions unavailable".to_string(),
    };
    h.billing.fail_history_for(ProductKind::Subscription, error.clone());
    h.billing.set_history(
        ProductKind::InApp,
        vec![make_purchase("inapp-old", "lifetime", ProductKind::InApp)],
    );

    let snapshot = h.controller.restore_purchases().await.expect("in-app restore succeeds");
    assert!(snapshot.is_entitled_to("pro"));

    let posted = h.backend.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].token, "inapp-old");

    let events = h.drain_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], SyncEvent::Failed(error));
    assert!(matches!(events[1], SyncEvent::Updated(_)));
}

#[tokio::test]
async fn test_restore_with_every_post_failing_returns_error() {
    let h = Harness::identified("alice");
    h.billing.set_history(
        ProductKind::Subscription,
        vec![make_purchase("sub", "monthly", ProductKind::Subscription)],
    );
    h.backend.fail_post_for("sub");

    let err = h.controller.restore_purchases().await.expect_err("post fails");
    assert!(matches!(err, SyncError::Backend(_)));
}

#[tokio::test]
async fn test_pending_sync_posts_only_unreported_and_prunes() {
    let mut h = Harness::identified("alice");
    let ledger = h.cache.ledger();
    ledger.mark_reported("sub-known").expect("mark");
    ledger.mark_reported("inapp-consumed").expect("mark");

    h.billing.set_active(
        vec![
            make_purchase("sub-known", "monthly", ProductKind::Subscription),
            make_purchase("sub-new", "annual", ProductKind::Subscription),
        ],
        vec![make_purchase("inapp-new", "coins", ProductKind::InApp)],
    );

    let posted = h.controller.sync_pending_purchases().await.expect("sync succeeds");
    assert_eq!(posted, 2);

    let posted_tokens: HashSet<String> =
        h.backend.posted().into_iter().map(|p| p.token).collect();
    assert_eq!(
        posted_tokens,
        ["sub-new", "inapp-new"]
            .iter()
            .map(|s| s.to_string())
            .collect::<HashSet<String>>()
    );
    assert_eq!(
        ledger.get_reported_fingerprints().expect("read"),
        fingerprints(&["sub-known", "sub-new", "inapp-new"])
    );
    assert_eq!(h.drain_events().len(), 2);

    // Nothing left to post on a second pass.
    assert_eq!(h.controller.sync_pending_purchases().await, Ok(0));
    assert_eq!(h.backend.posted().len(), 2);
}

#[tokio::test]
async fn test_pending_sync_skips_inactive_purchases() {
    let h = Harness::identified("alice");
    let mut expired = make_purchase("sub-expired", "monthly", ProductKind::Subscription);
    expired.is_active = false;
    h.billing.set_active(vec![expired], vec![]);

    assert_eq!(h.controller.sync_pending_purchases().await, Ok(0));
    assert!(h.backend.posted().is_empty());
}
