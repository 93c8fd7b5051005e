//! Service wiring and the subscriber lifecycle.
//!
//! [`App`] owns one instance of every engine, built from injected parts
//! (database, cache, router, payment provider, notifier) so tests swap in the
//! in-memory variants.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use hotspot_core::model::new_hotspot_password;
use hotspot_core::phone::{local_form, normalize_e164};
use hotspot_core::{ApprovalStatus, Counters, Decision, Role, Subscriber, decide};
use hotspot_routeros::RouterApi;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::cache::KvCache;
use crate::devices::{BindingOutcome, DeviceRegistry};
use crate::error::{HotspotError, Result};
use crate::idempotency::Idempotency;
use crate::ledger::{Ledger, RoleChange, estimate_debt_price};
use crate::locks::KeyedLocks;
use crate::notify::{Notifier, send_best_effort};
use crate::payment::{PaymentDeps, PaymentFlow, PaymentProvider};
use crate::reconcile::{ReconcileOptions, ReconcileReport, Reconciler};
use crate::scheduler::Scheduler;
use crate::settings::{HotspotSettings, SettingsStore};
use crate::storage::{Approval, Database, DatabaseError, DebtItem, Device};

pub const AUDIT_SUBSCRIBER_APPROVED: &str = "subscriber_approved";
pub const AUDIT_SUBSCRIBER_REJECTED: &str = "subscriber_rejected";
pub const AUDIT_SUBSCRIBER_BLOCKED: &str = "subscriber_blocked";
pub const AUDIT_ROLE_CHANGED: &str = "role_changed";

/// Injected dependencies.
pub struct AppParts {
    pub db: Database,
    pub settings: SettingsStore,
    pub cache: Arc<dyn KvCache>,
    pub router: Arc<dyn RouterApi>,
    pub provider: Arc<dyn PaymentProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub counters: Counters,
    pub production: bool,
    pub admin_token: Option<String>,
}

#[derive(Clone)]
pub struct App {
    pub db: Database,
    pub settings: SettingsStore,
    pub counters: Counters,
    pub ledger: Ledger,
    pub devices: DeviceRegistry,
    pub reconciler: Reconciler,
    pub payments: PaymentFlow,
    pub scheduler: Scheduler,
    pub notifier: Arc<dyn Notifier>,
    pub admin_token: Option<String>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("admin_api", &self.admin_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Approval result. The reconcile is best effort.
#[derive(Debug, Clone, Serialize)]
pub struct Approved {
    pub subscriber: SubscriberView,
    pub reconcile: Option<ReconcileReport>,
}

/// A subscriber without its credential.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberView {
    pub id: String,
    pub phone: String,
    pub full_name: String,
    pub role: Role,
    pub approval: ApprovalStatus,
    pub is_active: bool,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub purchased_mb: f64,
    pub used_mb: f64,
    pub remaining_mb: f64,
    pub is_unlimited: bool,
    pub expiry_at: Option<DateTime<Utc>>,
}

impl From<&Subscriber> for SubscriberView {
    fn from(sub: &Subscriber) -> Self {
        Self {
            id: sub.id.clone(),
            phone: sub.phone.clone(),
            full_name: sub.full_name.clone(),
            role: sub.role,
            approval: sub.approval,
            is_active: sub.is_active,
            is_blocked: sub.is_blocked,
            blocked_reason: sub.blocked_reason.clone(),
            purchased_mb: sub.purchased_mb,
            used_mb: sub.used_mb,
            remaining_mb: sub.remaining_mb().max(0.0),
            is_unlimited: sub.is_unlimited,
            expiry_at: sub.expiry_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DebtSummary {
    pub auto_mb: f64,
    pub manual_mb: f64,
    pub total_mb: f64,
    /// What settling all of it would cost, when a package can price it.
    pub estimated_price: Option<i64>,
    pub items: Vec<DebtItem>,
}

/// Everything a subscriber's status page shows.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatus {
    pub subscriber: SubscriberView,
    pub decision: Decision,
    pub debt: DebtSummary,
    pub devices: Vec<Device>,
}

/// A login binding with the reconciles it triggered.
#[derive(Debug, Clone, Serialize)]
pub struct BindResult {
    pub device: Device,
    pub evicted: Vec<Device>,
    pub reconciled: Vec<ReconcileReport>,
}

impl App {
    pub fn new(parts: AppParts) -> Self {
        let AppParts {
            db,
            settings,
            cache,
            router,
            provider,
            notifier,
            counters,
            production,
            admin_token,
        } = parts;

        let ledger = Ledger::new(db.clone(), counters.clone());
        let devices = DeviceRegistry::new(db.clone(), counters.clone());
        let reconciler = Reconciler::new(
            db.clone(),
            router,
            settings.clone(),
            KeyedLocks::new(),
            counters.clone(),
        );
        let idempotency = Idempotency::new(cache.clone(), db.clone(), counters.clone());
        let payments = PaymentFlow::new(PaymentDeps {
            db: db.clone(),
            ledger: ledger.clone(),
            reconciler: reconciler.clone(),
            idempotency,
            provider,
            notifier: notifier.clone(),
            settings: settings.clone(),
            counters: counters.clone(),
            production,
        });
        let scheduler = Scheduler {
            db: db.clone(),
            settings: settings.clone(),
            reconciler: reconciler.clone(),
            ledger: ledger.clone(),
            payments: payments.clone(),
            cache,
            notifier: notifier.clone(),
            counters: counters.clone(),
        };

        Self {
            db,
            settings,
            counters,
            ledger,
            devices,
            reconciler,
            payments,
            scheduler,
            notifier,
            admin_token,
        }
    }

    async fn load_settings(&self) -> Result<HotspotSettings> {
        HotspotSettings::load(&self.settings).await
    }

    /// Reconcile and keep going on failure.
    async fn reconcile_quietly(&self, subscriber_id: &str, opts: ReconcileOptions) -> Option<ReconcileReport> {
        match self.reconciler.reconcile_subscriber(subscriber_id, opts).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(subscriber_id, error = %e, "Reconcile failed; next sweep retries");
                None
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// New PENDING subscriber.
    pub async fn register(&self, phone: &str, full_name: &str) -> Result<Subscriber> {
        let settings = self.load_settings().await?;
        let phone = normalize_e164(phone, &settings.country_code)?;
        let full_name = full_name.trim();
        if full_name.is_empty() {
            return Err(HotspotError::Validation("full_name is required".into()));
        }
        match self.db.get_subscriber_by_phone(&phone).await {
            Ok(_) => {
                return Err(HotspotError::Validation(
                    "Phone number is already registered".into(),
                ));
            }
            Err(DatabaseError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let sub = self
            .db
            .create_subscriber(&phone, full_name, Role::User)
            .await?;
        info!(subscriber_id = %sub.id, "Subscriber registered");
        Ok(sub)
    }

    /// Approve a PENDING subscriber: issue a credential and push it to the router.
    pub async fn approve(
        &self,
        subscriber_id: &str,
        router_profile: Option<&str>,
        router_server: Option<&str>,
        actor: Option<&str>,
    ) -> Result<Approved> {
        let settings = self.load_settings().await?;
        let sub = self.db.get_subscriber(subscriber_id).await?;
        if sub.approval != ApprovalStatus::Pending {
            return Err(HotspotError::Validation(format!(
                "Subscriber is {}, not PENDING",
                sub.approval.as_str()
            )));
        }

        let password = new_hotspot_password();
        let sub = self
            .db
            .approve_subscriber(
                subscriber_id,
                &Approval {
                    hotspot_password: &password,
                    router_profile,
                    router_server: router_server.or(settings.hotspot_server.as_deref()),
                    approved_by: actor,
                },
            )
            .await?;
        self.db
            .record_audit(AUDIT_SUBSCRIBER_APPROVED, actor, Some(&sub.id), &json!({}))
            .await?;
        info!(subscriber_id, "Subscriber approved");

        let reconcile = self
            .reconcile_quietly(subscriber_id, ReconcileOptions { force_profile: true })
            .await;
        let message = format!(
            "Your hotspot account is approved. Username: {} Password: {password}",
            local_form(&sub.phone, &settings.country_code)
        );
        send_best_effort(self.notifier.as_ref(), &self.counters, &sub.phone, &message).await;

        Ok(Approved {
            subscriber: SubscriberView::from(&sub),
            reconcile,
        })
    }

    /// Reject a subscriber: purge it from the router and delete the row.
    pub async fn reject(&self, subscriber_id: &str, actor: Option<&str>) -> Result<()> {
        let settings = self.load_settings().await?;
        let sub = self.db.get_subscriber(subscriber_id).await?;
        if let Err(e) = self.reconciler.purge(&sub, &settings.country_code).await {
            warn!(subscriber_id, error = %e, "Router purge failed; orphan sweep will finish it");
        }
        self.db.delete_subscriber(subscriber_id).await?;
        self.db
            .record_audit(
                AUDIT_SUBSCRIBER_REJECTED,
                actor,
                Some(subscriber_id),
                &json!({ "phone": sub.phone, "approval": sub.approval.as_str() }),
            )
            .await?;
        info!(subscriber_id, "Subscriber rejected");
        Ok(())
    }

    pub async fn block(
        &self,
        subscriber_id: &str,
        reason: &str,
        actor: Option<&str>,
    ) -> Result<Subscriber> {
        let sub = self
            .ledger
            .set_blocked(subscriber_id, true, Some(reason), actor, Utc::now())
            .await?;
        self.db
            .record_audit(
                AUDIT_SUBSCRIBER_BLOCKED,
                actor,
                Some(subscriber_id),
                &json!({ "blocked": true, "reason": reason }),
            )
            .await?;
        self.reconcile_quietly(subscriber_id, ReconcileOptions::default())
            .await;
        Ok(sub)
    }

    pub async fn unblock(&self, subscriber_id: &str, actor: Option<&str>) -> Result<Subscriber> {
        let sub = self
            .ledger
            .set_blocked(subscriber_id, false, None, actor, Utc::now())
            .await?;
        self.db
            .record_audit(
                AUDIT_SUBSCRIBER_BLOCKED,
                actor,
                Some(subscriber_id),
                &json!({ "blocked": false }),
            )
            .await?;
        self.reconcile_quietly(subscriber_id, ReconcileOptions::default())
            .await;
        Ok(sub)
    }

    /// Change role. The auto debt a new KOMANDAN keeps is returned for review.
    pub async fn set_role(
        &self,
        subscriber_id: &str,
        role: Role,
        actor: Option<&str>,
    ) -> Result<RoleChange> {
        let change = self
            .ledger
            .set_role(subscriber_id, role, actor, Utc::now())
            .await?;
        self.db
            .record_audit(
                AUDIT_ROLE_CHANGED,
                actor,
                Some(subscriber_id),
                &json!({
                    "role": role.as_str(),
                    "cleared_manual_mb": change.cleared_manual_mb,
                    "auto_debt_mb": change.auto_debt_mb,
                }),
            )
            .await?;
        self.reconcile_quietly(subscriber_id, ReconcileOptions::default())
            .await;
        Ok(change)
    }

    pub async fn add_manual_debt(
        &self,
        subscriber_id: &str,
        amount_mb: f64,
        debt_date: Option<NaiveDate>,
        note: Option<&str>,
        actor: Option<&str>,
    ) -> Result<Subscriber> {
        let settings = self.load_settings().await?;
        let now = Utc::now();
        let sub = self
            .ledger
            .add_manual_debt(
                subscriber_id,
                amount_mb,
                debt_date.unwrap_or_else(|| now.date_naive()),
                note,
                actor,
                &settings,
                now,
            )
            .await?;
        if sub.is_blocked_for_debt() {
            let message = format!(
                "Your access is blocked: outstanding debt of {:.0} MB. Pay the debt to restore access.",
                sub.total_debt_mb()
            );
            send_best_effort(self.notifier.as_ref(), &self.counters, &sub.phone, &message).await;
        }
        self.reconcile_quietly(subscriber_id, ReconcileOptions::default())
            .await;
        Ok(sub)
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Bind the MAC a subscriber logged in from, then reconcile every owner
    /// the binding touched.
    pub async fn bind_device(
        &self,
        subscriber_id: &str,
        mac: &str,
        ip: Option<&str>,
        confirm_takeover: bool,
    ) -> Result<BindResult> {
        let settings = self.load_settings().await?;
        let BindingOutcome {
            device,
            reconcile,
            evicted,
        } = self
            .devices
            .apply_binding_for_login(subscriber_id, mac, ip, confirm_takeover, &settings, Utc::now())
            .await?;

        let mut reconciled = Vec::with_capacity(reconcile.len());
        for id in &reconcile {
            if let Some(report) = self.reconcile_quietly(id, ReconcileOptions::default()).await {
                reconciled.push(report);
            }
        }
        Ok(BindResult {
            device,
            evicted,
            reconciled,
        })
    }

    pub async fn revoke_device(&self, device_id: &str, actor: Option<&str>) -> Result<Device> {
        let device = self.devices.revoke(device_id, actor, Utc::now()).await?;
        self.reconcile_quietly(&device.subscriber_id, ReconcileOptions::default())
            .await;
        Ok(device)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn status(&self, subscriber_id: &str) -> Result<SubscriberStatus> {
        let settings = self.load_settings().await?;
        let sub = self.db.get_subscriber(subscriber_id).await?;
        let decision = decide(&sub, Utc::now(), &settings.policy);
        let packages = self.db.list_active_packages().await?;
        let total = sub.total_debt_mb();
        let items = self
            .db
            .list_debt_items(subscriber_id)
            .await?
            .into_iter()
            .filter(|i| i.paid_at.is_none())
            .collect();

        Ok(SubscriberStatus {
            subscriber: SubscriberView::from(&sub),
            decision,
            debt: DebtSummary {
                auto_mb: sub.auto_debt_mb,
                manual_mb: sub.manual_debt_mb,
                total_mb: total,
                estimated_price: (total > 0.0)
                    .then(|| estimate_debt_price(total, &packages))
                    .flatten(),
                items,
            },
            devices: self.db.list_devices(subscriber_id).await?,
        })
    }

    pub async fn reconcile(&self, subscriber_id: &str, force_profile: bool) -> Result<ReconcileReport> {
        self.reconciler
            .reconcile_subscriber(subscriber_id, ReconcileOptions { force_profile })
            .await
    }
}
