#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Usage sync, debt blocking and device takeover against the in-memory router.

mod common;

use chrono::Utc;
use hotspot_core::{AccessState, decide};
use hotspot_daemon::HotspotError;
use hotspot_daemon::scheduler::Task;
use hotspot_daemon::settings::HotspotSettings;
use hotspot_routeros::RouterApi;

use common::{MB, harness};

#[tokio::test]
async fn quota_exhaustion_moves_the_device_to_habis() {
    let h = harness().await;
    let sub = h.approved("081234560010", "Gita").await;
    h.app
        .bind_device(&sub.id, "AA:BB:CC:00:00:10", Some("10.5.50.10"), false)
        .await
        .unwrap();
    let package = h.package(1.0, 30, 10_000).await;
    h.buy(&sub, &package).await;
    assert_eq!(h.lists_of("10.5.50.10").await, vec!["active"]);

    h.seed_host("AA:BB:CC:00:00:10", "10.5.50.10", 1024 * MB).await;
    h.app.scheduler.run_task(Task::UsageSync).await.unwrap();

    let after = h.db.get_subscriber(&sub.id).await.unwrap();
    assert!((after.used_mb - 1024.0).abs() < 1e-6);
    assert!(after.auto_debt_mb.abs() < 1e-6);
    assert!(!after.is_blocked);

    let settings = HotspotSettings::load(&h.app.settings).await.unwrap();
    assert_eq!(
        decide(&after, Utc::now(), &settings.policy).state,
        AccessState::Habis
    );
    assert_eq!(h.lists_of("10.5.50.10").await, vec!["habis"]);
}

#[tokio::test]
async fn overshoot_past_the_debt_limit_blocks() {
    let h = harness().await;
    let sub = h.approved("081234560011", "Hadi").await;
    h.app
        .bind_device(&sub.id, "AA:BB:CC:00:00:11", Some("10.5.50.11"), false)
        .await
        .unwrap();
    let package = h.package(1.0, 30, 10_000).await;
    h.buy(&sub, &package).await;

    h.seed_host("AA:BB:CC:00:00:11", "10.5.50.11", 2048 * MB).await;
    h.app.scheduler.run_task(Task::UsageSync).await.unwrap();

    let after = h.db.get_subscriber(&sub.id).await.unwrap();
    assert!((after.auto_debt_mb - 1024.0).abs() < 1e-6);
    assert!(after.is_blocked);
    assert_eq!(after.blocked_reason.as_deref(), Some("quota_debt_limit"));
    assert_eq!(h.counters.get("ledger.debt.blocked"), 1);

    let status = h.app.status(&sub.id).await.unwrap();
    assert_eq!(status.decision.state, AccessState::Blocked);
    assert_eq!(h.lists_of("10.5.50.11").await, vec!["blocked"]);

    let user = h.router.get_user("081234560011").await.unwrap().unwrap();
    assert_eq!(user.profile.as_deref(), Some("blocked"));

    // A second pass over the same counter changes nothing.
    let writes = h.router.transport().mutation_count();
    h.app.scheduler.run_task(Task::UsageSync).await.unwrap();
    let again = h.db.get_subscriber(&sub.id).await.unwrap();
    assert!((again.used_mb - after.used_mb).abs() < f64::EPSILON);
    assert_eq!(h.router.transport().mutation_count(), writes);
}

#[tokio::test]
async fn admin_block_and_unblock_move_the_device() {
    let h = harness().await;
    let sub = h.approved("081234560012", "Intan").await;
    h.app
        .bind_device(&sub.id, "AA:BB:CC:00:00:12", Some("10.5.50.12"), false)
        .await
        .unwrap();
    let package = h.package(5.0, 30, 25_000).await;
    h.buy(&sub, &package).await;

    h.app.block(&sub.id, "abuse", Some("admin")).await.unwrap();
    assert_eq!(h.lists_of("10.5.50.12").await, vec!["blocked"]);

    h.app.unblock(&sub.id, Some("admin")).await.unwrap();
    let after = h.db.get_subscriber(&sub.id).await.unwrap();
    assert!(!after.is_blocked);
    assert!(after.blocked_reason.is_none());
    assert_eq!(h.lists_of("10.5.50.12").await, vec!["active"]);
}

#[tokio::test]
async fn device_takeover_needs_confirmation() {
    let h = harness().await;
    let d = h.approved("081234561234", "Joko").await;
    let e = h.approved("081298765432", "Kiki").await;
    let mac = "AA:BB:CC:DD:EE:FF";

    h.app
        .bind_device(&d.id, mac, Some("10.5.50.30"), false)
        .await
        .unwrap();

    let err = h
        .app
        .bind_device(&e.id, mac, Some("10.5.50.30"), false)
        .await
        .unwrap_err();
    match &err {
        HotspotError::DeviceTakeoverRequired { incumbent } => {
            assert!(incumbent.contains("***"));
            assert!(incumbent.ends_with("1234"));
            assert!(!incumbent.contains("081234561234"));
        }
        other => panic!("expected takeover error, got {other:?}"),
    }
    assert_eq!(err.code(), "DEVICE_TAKEOVER_REQUIRED");
    assert_eq!(h.counters.get("device.takeover.required"), 1);

    let bound = h
        .app
        .bind_device(&e.id, mac, Some("10.5.50.30"), true)
        .await
        .unwrap();
    assert_eq!(bound.device.subscriber_id, e.id);
    assert_eq!(bound.reconciled.len(), 2);
    assert_eq!(h.counters.get("device.takeover"), 1);

    assert!(h.db.list_authorized_devices(&d.id).await.unwrap().is_empty());
    let owned = h.db.list_authorized_devices(&e.id).await.unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].mac, mac);
}

#[tokio::test]
async fn revoked_device_leaves_the_managed_lists() {
    let h = harness().await;
    let sub = h.approved("081234560013", "Lina").await;
    let bound = h
        .app
        .bind_device(&sub.id, "AA:BB:CC:00:00:13", Some("10.5.50.13"), false)
        .await
        .unwrap();
    assert_eq!(h.lists_of("10.5.50.13").await.len(), 1);

    h.app
        .revoke_device(&bound.device.id, Some("admin"))
        .await
        .unwrap();
    assert!(h.lists_of("10.5.50.13").await.is_empty());
    assert!(h.db.list_authorized_devices(&sub.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn usage_sync_leaves_unlimited_subscribers_unmetered() {
    let h = harness().await;
    let sub = h.approved("081234560014", "Maya").await;
    h.app
        .bind_device(&sub.id, "AA:BB:CC:00:00:14", Some("10.5.50.14"), false)
        .await
        .unwrap();
    let unlimited = h.package(0.0, 30, 50_000).await;
    h.buy(&sub, &unlimited).await;

    h.seed_host("AA:BB:CC:00:00:14", "10.5.50.14", 4096 * MB).await;
    h.app.scheduler.run_task(Task::UsageSync).await.unwrap();

    let after = h.db.get_subscriber(&sub.id).await.unwrap();
    assert!(after.is_unlimited);
    assert!(after.used_mb.abs() < f64::EPSILON);
    assert!(after.auto_debt_mb.abs() < f64::EPSILON);
    assert!(!after.is_blocked);
    assert_eq!(h.lists_of("10.5.50.14").await, vec!["active"]);
}
