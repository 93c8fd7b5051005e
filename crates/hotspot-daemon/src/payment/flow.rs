//! Payment Settlement Flow.
//!
//! Webhook deliveries and status polls both end in [`PaymentFlow::process`].
//! A SUCCESS transaction's effect (ledger credit, then router reconcile) runs
//! at most once per order: the webhook key drops repeated deliveries, the
//! effect gate and the per-order lock serialize attempts, and the single
//! `MIKROTIK_APPLY_SUCCESS` event is the durable record. A router failure
//! leaves the transaction SUCCESS without that event so the poll task retries.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hotspot_core::model::{is_valid_hotspot_password, new_hotspot_password};
use hotspot_core::order_id::{OrderKind, classify, new_debt_order_id, new_purchase_order_id};
use hotspot_core::phone::local_form;
use hotspot_core::{ApprovalStatus, Counters, Subscriber};
use hotspot_crypto::verify_provider_signature;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::notification::Notification;
use super::provider::{ChargeRequest, PROVIDER_NAME, PaymentProvider};
use crate::error::{HotspotError, Result};
use crate::idempotency::{EffectGate, Idempotency, WebhookClaim, webhook_key};
use crate::ledger::{Ledger, estimate_debt_price};
use crate::locks::KeyedLocks;
use crate::notify::{Notifier, send_best_effort};
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::settings::{HotspotSettings, SettingsStore};
use crate::storage::{
    ChargeUpdate, Database, EventSource, NewTransaction, Transaction, TransactionStatus,
    event_kind,
};

pub const EFFECT_PACKAGE_APPLY: &str = "package_apply";
pub const EFFECT_DEBT_SETTLEMENT: &str = "debt_settlement";

/// What happened to one provider notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutcome {
    /// The effect ran now.
    Applied,
    /// Status recorded; nothing (more) to apply.
    Recorded,
    /// Same delivery seen before.
    Duplicate,
    /// No transaction with this order id.
    UnknownOrder,
    /// Status we do not act on.
    Ignored,
    /// The effect failed or is running elsewhere; a later poll retries.
    Deferred,
}

/// Result of one effect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectResult {
    Applied,
    AlreadyDone,
    Busy,
    Failed,
}

/// One pass of the pending-transaction poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub polled: usize,
    pub settled: usize,
    pub expired: usize,
    pub retried: usize,
    pub failed: usize,
}

/// A created (or reused) payment order.
#[derive(Debug, Clone, Serialize)]
pub struct Initiation {
    pub transaction: Transaction,
    pub reused: bool,
}

/// Everything the flow talks to.
pub struct PaymentDeps {
    pub db: Database,
    pub ledger: Ledger,
    pub reconciler: Reconciler,
    pub idempotency: Idempotency,
    pub provider: Arc<dyn PaymentProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: SettingsStore,
    pub counters: Counters,
    /// Reject bad webhook signatures instead of only warning.
    pub production: bool,
}

#[derive(Clone)]
pub struct PaymentFlow {
    db: Database,
    ledger: Ledger,
    reconciler: Reconciler,
    idempotency: Idempotency,
    provider: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn Notifier>,
    settings: SettingsStore,
    counters: Counters,
    order_locks: KeyedLocks,
    production: bool,
}

impl std::fmt::Debug for PaymentFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentFlow")
            .field("production", &self.production)
            .finish_non_exhaustive()
    }
}

fn to_payload<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

impl PaymentFlow {
    pub fn new(deps: PaymentDeps) -> Self {
        Self {
            db: deps.db,
            ledger: deps.ledger,
            reconciler: deps.reconciler,
            idempotency: deps.idempotency,
            provider: deps.provider,
            notifier: deps.notifier,
            settings: deps.settings,
            counters: deps.counters,
            order_locks: KeyedLocks::new(),
            production: deps.production,
        }
    }

    /// Per-order serialization locks, pruned after each poll.
    pub const fn order_locks(&self) -> &KeyedLocks {
        &self.order_locks
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Entry point for the provider webhook.
    ///
    /// Only an invalid signature (in production) or an internal error is an
    /// `Err`; everything else is acknowledged.
    pub async fn handle_webhook(&self, n: &Notification) -> Result<NotificationOutcome> {
        self.verify_signature(n).await?;

        let key = webhook_key(
            PROVIDER_NAME,
            &n.order_id,
            &n.transaction_status,
            &n.status_code,
            n.transaction_id.as_deref().unwrap_or_default(),
        );
        if self.idempotency.claim_webhook(&key).await == WebhookClaim::Duplicate {
            debug!(order_id = %n.order_id, "Duplicate webhook delivery");
            return Ok(NotificationOutcome::Duplicate);
        }

        match self.process(n, EventSource::ProviderWebhook).await {
            Ok(outcome) => {
                if outcome == NotificationOutcome::Deferred {
                    self.idempotency.release_webhook(&key).await;
                }
                Ok(outcome)
            }
            Err(e) => {
                self.idempotency.release_webhook(&key).await;
                Err(e)
            }
        }
    }

    async fn verify_signature(&self, n: &Notification) -> Result<()> {
        let server_key = self.settings.get_string("PAYMENT_SERVER_KEY").await?;
        let valid = match (server_key, n.signature_key.as_deref()) {
            (Some(key), Some(received)) => verify_provider_signature(
                &n.order_id,
                &n.status_code,
                &n.gross_amount,
                &key,
                received,
            ),
            _ => false,
        };
        if valid {
            return Ok(());
        }
        self.counters.incr("payment.webhook.signature_invalid");
        if self.production {
            warn!(order_id = %n.order_id, "Rejected webhook with invalid signature");
            return Err(HotspotError::ProviderSignatureInvalid);
        }
        warn!(order_id = %n.order_id, "Webhook signature invalid; accepted outside production");
        Ok(())
    }

    /// Record a provider status for its transaction and apply the effect on
    /// success.
    pub async fn process(
        &self,
        n: &Notification,
        source: EventSource,
    ) -> Result<NotificationOutcome> {
        let tx = match self.db.get_transaction_by_order(&n.order_id).await {
            Ok(tx) => tx,
            Err(hotspot_core::db::DatabaseError::NotFound(_)) => {
                warn!(order_id = %n.order_id, "Notification for unknown order");
                self.counters.incr("payment.notification.unknown_order");
                return Ok(NotificationOutcome::UnknownOrder);
            }
            Err(e) => return Err(e.into()),
        };

        let _guard = self.order_locks.lock(&tx.order_id).await;
        let now = Utc::now();
        let payload = to_payload(n);
        let mapped = n.mapped_status();
        self.db
            .record_transaction_event(
                &tx.id,
                source,
                event_kind::STATUS_CHANGE,
                mapped,
                payload.as_deref(),
            )
            .await?;

        let Some(status) = mapped else {
            debug!(order_id = %tx.order_id, status = %n.transaction_status, "Ignoring provider status");
            return Ok(NotificationOutcome::Ignored);
        };

        if tx.provider_transaction_id.is_none() && n.transaction_id.is_some() {
            self.db
                .record_charge(
                    &tx.id,
                    &ChargeUpdate {
                        provider_transaction_id: n.transaction_id.as_deref(),
                        ..ChargeUpdate::default()
                    },
                )
                .await?;
        }
        if self
            .db
            .transition_transaction(&tx.id, status, payload.as_deref(), now)
            .await?
        {
            info!(order_id = %tx.order_id, from = %tx.status, to = %status, "Transaction status changed");
        }

        let tx = self.db.get_transaction(&tx.id).await?;
        let current = tx.status()?;
        if status == TransactionStatus::Success && current != TransactionStatus::Success {
            error!(order_id = %tx.order_id, status = %current, "Settlement for a transaction already closed");
            self.counters.incr("payment.late_settlement");
            return Ok(NotificationOutcome::Recorded);
        }
        if current != TransactionStatus::Success {
            return Ok(NotificationOutcome::Recorded);
        }

        Ok(match self.apply_effect_locked(&tx, source).await? {
            EffectResult::Applied => NotificationOutcome::Applied,
            EffectResult::AlreadyDone => NotificationOutcome::Recorded,
            EffectResult::Busy | EffectResult::Failed => NotificationOutcome::Deferred,
        })
    }

    // =========================================================================
    // Effects
    // =========================================================================

    /// Apply the effect of a SUCCESS transaction, taking its order lock.
    pub async fn apply_effect(&self, tx: &Transaction, source: EventSource) -> Result<EffectResult> {
        let _guard = self.order_locks.lock(&tx.order_id).await;
        self.apply_effect_locked(tx, source).await
    }

    async fn apply_effect_locked(&self, tx: &Transaction, source: EventSource) -> Result<EffectResult> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let kind = classify(&tx.order_id, &settings.debt_prefixes);
        let effect = match kind {
            OrderKind::Purchase => EFFECT_PACKAGE_APPLY,
            OrderKind::DebtSettlement { .. } => EFFECT_DEBT_SETTLEMENT,
        };

        let lock_held = match self.idempotency.begin_effect(&tx.order_id, effect).await? {
            EffectGate::AlreadyDone => {
                if !tx.effects_applied() {
                    self.db.mark_effects_applied(&tx.id).await?;
                }
                return Ok(EffectResult::AlreadyDone);
            }
            EffectGate::Busy => {
                debug!(order_id = %tx.order_id, effect, "Effect running elsewhere");
                return Ok(EffectResult::Busy);
            }
            EffectGate::Proceed { lock_held } => lock_held,
        };
        debug!(order_id = %tx.order_id, effect, lock_held, "Applying effect");

        let now = Utc::now();
        let ledger = match self.apply_ledger(tx, kind, now).await {
            Ok(ledger) => ledger,
            Err(e) => {
                self.idempotency.abort_effect(&tx.order_id, effect).await;
                return Err(e);
            }
        };

        let opts = ReconcileOptions {
            force_profile: kind == OrderKind::Purchase,
        };
        let failure = match self
            .reconciler
            .reconcile_subscriber(&ledger.subscriber.id, opts)
            .await
        {
            Ok(report) if report.is_clean() => None,
            Ok(report) => Some(report.failures.join("; ")),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            warn!(order_id = %tx.order_id, effect, reason = %reason, "Router apply failed; will retry");
            self.db
                .record_transaction_event(
                    &tx.id,
                    source,
                    event_kind::MIKROTIK_APPLY_FAILED,
                    None,
                    to_payload(&serde_json::json!({ "error": reason })).as_deref(),
                )
                .await?;
            self.counters.incr("payment.effect.failed");
            self.idempotency.abort_effect(&tx.order_id, effect).await;
            return Ok(EffectResult::Failed);
        }

        self.db
            .record_transaction_event(
                &tx.id,
                source,
                event_kind::MIKROTIK_APPLY_SUCCESS,
                Some(TransactionStatus::Success),
                None,
            )
            .await?;
        self.db.mark_effects_applied(&tx.id).await?;
        self.idempotency.complete_effect(&tx.order_id, effect).await;
        self.counters.incr("payment.effect.applied");
        info!(order_id = %tx.order_id, effect, subscriber_id = %ledger.subscriber.id, "Payment effect applied");

        send_best_effort(
            self.notifier.as_ref(),
            &self.counters,
            &ledger.subscriber.phone,
            &ledger.message,
        )
        .await;
        Ok(EffectResult::Applied)
    }

    async fn apply_ledger(
        &self,
        tx: &Transaction,
        kind: OrderKind,
        now: DateTime<Utc>,
    ) -> Result<LedgerApplied> {
        let subscriber_id = tx.subscriber_id.as_deref().ok_or_else(|| {
            HotspotError::NotFound(format!("Subscriber of order {}", tx.order_id))
        })?;

        let (subscriber, applied, message) = match kind {
            OrderKind::Purchase => {
                let package_id = tx.package_id.as_deref().ok_or_else(|| {
                    HotspotError::Internal(format!("Order {} has no package", tx.order_id))
                })?;
                let package = self.db.get_package(package_id).await?;
                let outcome = self
                    .ledger
                    .apply_purchase(subscriber_id, &package, &tx.id, now)
                    .await?;
                self.prepare_credentials(&outcome.subscriber, package.router_profile.as_deref())
                    .await?;
                let subscriber = self.db.get_subscriber(subscriber_id).await?;
                let until = subscriber
                    .expiry_at
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_default();
                let message = format!(
                    "Payment {} received. {} is active until {until}.",
                    tx.order_id, package.name
                );
                (subscriber, outcome.applied, message)
            }
            OrderKind::DebtSettlement { target } => {
                let item_id = match target {
                    Some(uuid) => {
                        let wanted = uuid.to_string();
                        self.db
                            .list_debt_items(subscriber_id)
                            .await?
                            .into_iter()
                            .find(|item| item.id == wanted)
                            .map(|item| item.id)
                    }
                    None => None,
                };
                let outcome = self
                    .ledger
                    .apply_debt_settlement(subscriber_id, item_id.as_deref(), &tx.id, now)
                    .await?;
                let message = format!(
                    "Debt payment {} received. Remaining debt: {:.0} MB.",
                    tx.order_id,
                    outcome.subscriber.total_debt_mb()
                );
                (outcome.subscriber, outcome.applied, message)
            }
        };

        if applied {
            self.db
                .record_transaction_event(
                    &tx.id,
                    EventSource::App,
                    event_kind::LEDGER_APPLIED,
                    Some(TransactionStatus::Success),
                    None,
                )
                .await?;
        }
        Ok(LedgerApplied {
            subscriber,
            message,
        })
    }

    /// Issue a fresh credential when the stored one is missing or malformed,
    /// and adopt the package's router profile.
    async fn prepare_credentials(&self, sub: &Subscriber, profile: Option<&str>) -> Result<()> {
        if !sub
            .hotspot_password
            .as_deref()
            .is_some_and(is_valid_hotspot_password)
        {
            self.db
                .set_hotspot_password(&sub.id, &new_hotspot_password())
                .await?;
            info!(subscriber_id = %sub.id, "Hotspot credential regenerated");
        }
        if let Some(profile) = profile
            && sub.router_profile.as_deref() != Some(profile)
        {
            self.db.set_router_profile(&sub.id, Some(profile)).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Poll UNKNOWN/PENDING transactions, expire stale ones locally and retry
    /// SUCCESS transactions whose router effect never landed.
    pub async fn poll_pending(&self) -> Result<PollReport> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let now = Utc::now();
        let mut report = PollReport::default();

        for tx in self.db.list_pollable(now, settings.poll_throttle_secs).await? {
            report.polled += 1;
            self.db.touch_polled(&tx.id, now).await?;
            let terminal = match self.provider.status(&tx.order_id).await {
                Ok(Some(n)) => match self.process(&n, EventSource::ProviderPoll).await {
                    Ok(outcome) => {
                        if n.mapped_status() == Some(TransactionStatus::Success) {
                            report.settled += 1;
                        }
                        if outcome == NotificationOutcome::Deferred {
                            report.failed += 1;
                        }
                        n.mapped_status().is_some_and(|s| s.is_terminal())
                    }
                    Err(e) => {
                        warn!(order_id = %tx.order_id, error = %e, "Processing polled status failed");
                        report.failed += 1;
                        continue;
                    }
                },
                Ok(None) => false,
                Err(e) => {
                    warn!(order_id = %tx.order_id, error = %e, "Provider status poll failed");
                    self.counters.incr("payment.poll.failed");
                    report.failed += 1;
                    false
                }
            };

            if !terminal
                && tx.expiry_at.is_some_and(|t| t < now.timestamp())
                && self.expire(&tx, now).await?
            {
                report.expired += 1;
            }
        }

        for tx in self.db.list_unapplied_successes().await? {
            report.retried += 1;
            match self.apply_effect(&tx, EventSource::ProviderPoll).await {
                Ok(EffectResult::Applied | EffectResult::AlreadyDone) => {}
                Ok(EffectResult::Busy | EffectResult::Failed) => report.failed += 1,
                Err(e) => {
                    warn!(order_id = %tx.order_id, error = %e, "Effect retry failed");
                    report.failed += 1;
                }
            }
        }

        self.order_locks.prune();
        if report != PollReport::default() {
            info!(?report, "Payment poll finished");
        }
        Ok(report)
    }

    async fn expire(&self, tx: &Transaction, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.order_locks.lock(&tx.order_id).await;
        let moved = self
            .db
            .transition_transaction(&tx.id, TransactionStatus::Expired, None, now)
            .await?;
        if moved {
            self.db
                .record_transaction_event(
                    &tx.id,
                    EventSource::App,
                    event_kind::STATUS_CHANGE,
                    Some(TransactionStatus::Expired),
                    None,
                )
                .await?;
            info!(order_id = %tx.order_id, "Transaction expired locally");
        }
        Ok(moved)
    }

    // =========================================================================
    // Initiation and cancellation
    // =========================================================================

    /// Start (or reuse) a package purchase.
    pub async fn initiate_purchase(
        &self,
        subscriber_id: &str,
        package_id: &str,
        payment_method: &str,
    ) -> Result<Initiation> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let now = Utc::now();
        let sub = self.approved_subscriber(subscriber_id).await?;
        let package = self.db.get_package(package_id).await?;
        if !package.is_active {
            return Err(HotspotError::Validation(format!(
                "Package {} is not for sale",
                package.name
            )));
        }
        Ledger::check_package_covers_debt(&sub, &package)?;

        if let Some(live) = self
            .db
            .find_live_purchase(subscriber_id, package_id, now)
            .await?
            && live.payment_method == payment_method
        {
            debug!(order_id = %live.order_id, "Reusing live purchase order");
            return Ok(Initiation {
                transaction: live,
                reused: true,
            });
        }

        let order_id = new_purchase_order_id(&settings.purchase_prefix);
        let tx = self
            .db
            .create_transaction(&NewTransaction {
                subscriber_id,
                package_id: Some(package_id),
                order_id: &order_id,
                amount: package.price,
                payment_method,
                debt_mb: None,
                debt_item_id: None,
                expiry_at: Some(now + Duration::minutes(settings.payment_expiry_minutes)),
            })
            .await?;
        let tx = self
            .charge(&tx, &sub, &package.name, &settings)
            .await?;
        Ok(Initiation {
            transaction: tx,
            reused: false,
        })
    }

    /// Start a payment for one manual debt item, or for all outstanding debt.
    pub async fn initiate_debt_settlement(
        &self,
        subscriber_id: &str,
        item_id: Option<&str>,
        payment_method: &str,
    ) -> Result<Initiation> {
        let settings = HotspotSettings::load(&self.settings).await?;
        let now = Utc::now();
        let sub = self.approved_subscriber(subscriber_id).await?;

        let (debt_mb, target) = match item_id {
            Some(id) => {
                let item = self
                    .db
                    .list_debt_items(subscriber_id)
                    .await?
                    .into_iter()
                    .find(|i| i.id == id)
                    .ok_or_else(|| HotspotError::NotFound(format!("Debt item {id}")))?;
                let target = Uuid::parse_str(&item.id).map_err(|_| {
                    HotspotError::Validation(format!("Debt item id {id} is not a uuid"))
                })?;
                (item.remaining_mb(), target)
            }
            None => (sub.total_debt_mb(), Uuid::new_v4()),
        };
        if debt_mb <= 0.0 {
            return Err(HotspotError::Validation("No outstanding debt".into()));
        }

        let packages = self.db.list_active_packages().await?;
        let amount = estimate_debt_price(debt_mb, &packages).ok_or_else(|| {
            HotspotError::Validation("No quota package available to price the debt".into())
        })?;

        let order_id = new_debt_order_id(settings.debt_prefix(), target);
        let tx = self
            .db
            .create_transaction(&NewTransaction {
                subscriber_id,
                package_id: None,
                order_id: &order_id,
                amount,
                payment_method,
                debt_mb: Some(debt_mb),
                debt_item_id: item_id,
                expiry_at: Some(now + Duration::minutes(settings.payment_expiry_minutes)),
            })
            .await?;
        let item_name = format!("Debt settlement {debt_mb:.0} MB");
        let tx = self.charge(&tx, &sub, &item_name, &settings).await?;
        Ok(Initiation {
            transaction: tx,
            reused: false,
        })
    }

    async fn approved_subscriber(&self, id: &str) -> Result<Subscriber> {
        let sub = self.db.get_subscriber(id).await?;
        if sub.approval != ApprovalStatus::Approved {
            return Err(HotspotError::Validation("Subscriber is not approved".into()));
        }
        Ok(sub)
    }

    /// Ask the provider for a charge: PENDING on success, FAILED otherwise.
    async fn charge(
        &self,
        tx: &Transaction,
        sub: &Subscriber,
        item_name: &str,
        settings: &HotspotSettings,
    ) -> Result<Transaction> {
        self.db
            .record_transaction_event(&tx.id, EventSource::App, event_kind::INITIATED, None, None)
            .await?;
        let request = ChargeRequest {
            order_id: tx.order_id.clone(),
            gross_amount: tx.amount,
            payment_method: tx.payment_method.clone(),
            item_name: item_name.to_string(),
            customer_name: sub.full_name.clone(),
            customer_phone: local_form(&sub.phone, &settings.country_code),
            expiry_minutes: settings.payment_expiry_minutes,
        };
        let now = Utc::now();

        match self.provider.charge(&request).await {
            Ok(n) => {
                let details = n.payment_details().map(|d| d.to_string());
                self.db
                    .record_charge(
                        &tx.id,
                        &ChargeUpdate {
                            provider_transaction_id: n.transaction_id.as_deref(),
                            payment_details: details.as_deref(),
                            expiry_at: n.expiry_at(),
                        },
                    )
                    .await?;
                self.db
                    .transition_transaction(
                        &tx.id,
                        TransactionStatus::Pending,
                        to_payload(&n).as_deref(),
                        now,
                    )
                    .await?;
                self.db
                    .record_transaction_event(
                        &tx.id,
                        EventSource::App,
                        event_kind::STATUS_CHANGE,
                        Some(TransactionStatus::Pending),
                        to_payload(&n).as_deref(),
                    )
                    .await?;
                info!(order_id = %tx.order_id, amount = tx.amount, method = %tx.payment_method, "Payment initiated");
                Ok(self.db.get_transaction(&tx.id).await?)
            }
            Err(e) => {
                let payload = to_payload(&serde_json::json!({ "error": e.to_string() }));
                self.db
                    .transition_transaction(
                        &tx.id,
                        TransactionStatus::Failed,
                        payload.as_deref(),
                        now,
                    )
                    .await?;
                self.db
                    .record_transaction_event(
                        &tx.id,
                        EventSource::App,
                        event_kind::STATUS_CHANGE,
                        Some(TransactionStatus::Failed),
                        payload.as_deref(),
                    )
                    .await?;
                warn!(order_id = %tx.order_id, error = %e, "Charge failed");
                self.counters.incr("payment.charge.failed");
                Err(e.into())
            }
        }
    }

    /// Cancel an open transaction. A SUCCESS transaction cannot be cancelled;
    /// other terminal ones are returned unchanged.
    pub async fn cancel(&self, order_id: &str, actor: Option<&str>) -> Result<Transaction> {
        let _guard = self.order_locks.lock(order_id).await;
        let tx = self.db.get_transaction_by_order(order_id).await?;
        match tx.status()? {
            TransactionStatus::Success => {
                return Err(HotspotError::TransactionAlreadySuccess(tx.order_id));
            }
            s if s.is_terminal() => return Ok(tx),
            _ => {}
        }

        if let Err(e) = self.provider.cancel(order_id).await {
            warn!(order_id, error = %e, "Provider cancel failed; cancelling locally");
        }
        let now = Utc::now();
        self.db
            .transition_transaction(&tx.id, TransactionStatus::Cancelled, None, now)
            .await?;
        self.db
            .record_transaction_event(
                &tx.id,
                EventSource::App,
                event_kind::CANCELLED,
                Some(TransactionStatus::Cancelled),
                to_payload(&serde_json::json!({ "actor": actor })).as_deref(),
            )
            .await?;
        info!(order_id, actor, "Transaction cancelled");
        Ok(self.db.get_transaction(&tx.id).await?)
    }
}

struct LedgerApplied {
    subscriber: Subscriber,
    message: String,
}
