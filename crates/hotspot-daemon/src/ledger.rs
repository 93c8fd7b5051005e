//! Quota & Debt Ledger.
//!
//! Every operation runs under the subscriber's row lock and writes its state
//! change together with one mutation log row in a single commit. Operations
//! keyed by a transaction id are idempotent: a second call sees the logged key
//! and returns the current state untouched.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use hotspot_core::model::{
    BLOCK_REASON_DEBT_END_OF_MONTH, BLOCK_REASON_DEBT_LIMIT, BYTES_PER_MB,
};
use hotspot_core::{Counters, Package, Role, Subscriber};
use tracing::{debug, info, warn};

use crate::error::{HotspotError, Result};
use crate::settings::HotspotSettings;
use crate::storage::{Database, LockedSubscriber, MutationDetails};

/// Result of applying a package purchase.
#[derive(Debug, Clone)]
pub struct PurchaseOutcome {
    pub subscriber: Subscriber,
    /// False when this transaction was already applied.
    pub applied: bool,
}

/// Result of absorbing one device counter reading.
#[derive(Debug, Clone)]
pub struct UsageOutcome {
    pub subscriber: Subscriber,
    pub delta_mb: f64,
    /// The reading pushed total debt over the cap and blocked the subscriber.
    pub blocked: bool,
}

#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub subscriber: Subscriber,
    pub applied: bool,
    pub unblocked: bool,
}

#[derive(Debug, Clone)]
pub struct RoleChange {
    pub subscriber: Subscriber,
    /// Auto debt left in place by a KOMANDAN promotion, for admin review.
    pub auto_debt_mb: Option<f64>,
    pub cleared_manual_mb: f64,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    db: Database,
    counters: Counters,
}

fn last_day_of_month(now: DateTime<Utc>) -> bool {
    now.date_naive()
        .succ_opt()
        .is_none_or(|next| next.month() != now.month())
}

/// Price of `debt_mb` derived from the cheapest active quota package that
/// covers it, scaled by volume and rounded up. Falls back to the largest
/// package when none covers the debt.
pub fn estimate_debt_price(debt_mb: f64, packages: &[Package]) -> Option<i64> {
    if debt_mb <= 0.0 {
        return Some(0);
    }
    let quota: Vec<&Package> = packages
        .iter()
        .filter(|p| p.is_active && !p.is_unlimited() && p.quota_mb() > 0.0)
        .collect();

    let covering = quota
        .iter()
        .filter(|p| p.quota_mb() >= debt_mb)
        .min_by_key(|p| p.price);
    let basis = covering.or_else(|| {
        quota
            .iter()
            .max_by(|a, b| a.quota_mb().total_cmp(&b.quota_mb()))
    })?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let price = (basis.price as f64 * debt_mb / basis.quota_mb()).ceil() as i64;
    Some(price)
}

impl Ledger {
    pub const fn new(db: Database, counters: Counters) -> Self {
        Self { db, counters }
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    /// Reject a quota package that does not exceed the outstanding debt.
    pub fn check_package_covers_debt(sub: &Subscriber, package: &Package) -> Result<()> {
        let debt = sub.total_debt_mb();
        if !package.is_unlimited() && debt > 0.0 && package.quota_mb() <= debt {
            return Err(HotspotError::QuotaPackageTooSmall {
                package_mb: package.quota_mb(),
                debt_mb: debt,
            });
        }
        Ok(())
    }

    /// Credit a paid package. Any outstanding debt is settled from it.
    pub async fn apply_purchase(
        &self,
        subscriber_id: &str,
        package: &Package,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome> {
        let mut locked = self.db.lock_subscriber(subscriber_id).await?;
        if locked.already_credited(transaction_id).await? {
            debug!(subscriber_id, transaction_id, "Purchase already applied");
            let subscriber = locked.commit().await?;
            return Ok(PurchaseOutcome {
                subscriber,
                applied: false,
            });
        }

        let open = locked.open_debt_items().await?;
        for item in &open {
            locked.settle_debt_item(&item.id, now).await?;
        }
        let manual_paid: f64 = open.iter().map(crate::storage::DebtItem::remaining_mb).sum();

        let sub = locked.subscriber_mut();
        let debt_settled = sub.auto_debt_mb + manual_paid;
        if package.is_unlimited() {
            sub.is_unlimited = true;
            sub.auto_debt_mb = 0.0;
        } else {
            let quota = package.quota_mb();
            if sub.is_unlimited {
                sub.purchased_mb = sub.used_mb + quota;
                sub.is_unlimited = false;
            } else {
                sub.purchased_mb += quota;
            }
            sub.used_mb += manual_paid;
            sub.auto_debt_mb = (sub.used_mb - sub.purchased_mb).max(0.0);
        }
        sub.manual_debt_mb = 0.0;

        let base = sub.expiry_at.map_or(now, |e| e.max(now));
        sub.expiry_at = Some(base + Duration::days(package.duration_days));

        if sub.is_blocked_for_debt() {
            sub.is_blocked = false;
            sub.blocked_reason = None;
        }

        locked
            .record(
                &MutationDetails::Purchase {
                    transaction_id: transaction_id.to_string(),
                    package_id: package.id.clone(),
                    package_name: package.name.clone(),
                    quota_mb: package.quota_mb(),
                    duration_days: package.duration_days,
                    debt_settled_mb: debt_settled,
                },
                Some(transaction_id),
                None,
                now,
            )
            .await?;
        locked.mark_credited(transaction_id, now).await?;
        let subscriber = locked.commit().await?;
        info!(subscriber_id, transaction_id, package = %package.name, "Purchase applied");
        self.counters.incr("ledger.purchase.applied");
        Ok(PurchaseOutcome {
            subscriber,
            applied: true,
        })
    }

    /// Feed one hotspot host byte counter for a device the subscriber owns.
    pub async fn absorb_usage(
        &self,
        subscriber_id: &str,
        mac: &str,
        bytes_total: u64,
        settings: &HotspotSettings,
        now: DateTime<Utc>,
    ) -> Result<UsageOutcome> {
        let mut locked = self.db.lock_subscriber(subscriber_id).await?;
        let Some(device) = locked.owned_device(mac).await? else {
            let subscriber = locked.commit().await?;
            return Ok(UsageOutcome {
                subscriber,
                delta_mb: 0.0,
                blocked: false,
            });
        };

        let baseline = device
            .last_bytes_total
            .and_then(|b| u64::try_from(b).ok());
        let delta_bytes = match baseline {
            Some(base) if bytes_total < base => {
                debug!(subscriber_id, mac, base, bytes_total, "Router counter reset, rebasing");
                self.counters.incr("usage.counter_reset");
                0
            }
            Some(base) => bytes_total - base,
            None => bytes_total,
        };
        locked.set_device_baseline(&device.id, bytes_total, now).await?;

        // Unlimited: baseline only, `used_mb` stays put.
        if locked.subscriber().is_unlimited {
            let subscriber = locked.commit().await?;
            return Ok(UsageOutcome {
                subscriber,
                delta_mb: 0.0,
                blocked: false,
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let delta_mb = delta_bytes as f64 / BYTES_PER_MB;
        if delta_bytes > 0 {
            let sub = locked.subscriber_mut();
            sub.used_mb += delta_mb;
            sub.auto_debt_mb = (sub.used_mb - sub.purchased_mb).max(0.0);
            locked
                .record(
                    &MutationDetails::Usage {
                        mac: mac.to_string(),
                        delta_mb,
                        bytes_total,
                        baseline,
                    },
                    None,
                    None,
                    now,
                )
                .await?;
        }

        let blocked = enforce_debt_limit(&mut locked, settings, now).await?;
        let subscriber = locked.commit().await?;
        if blocked {
            self.counters.incr("ledger.debt.blocked");
        }
        Ok(UsageOutcome {
            subscriber,
            delta_mb,
            blocked,
        })
    }

    /// Append a manual debt item. Not allowed for KOMANDAN.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_manual_debt(
        &self,
        subscriber_id: &str,
        amount_mb: f64,
        debt_date: NaiveDate,
        note: Option<&str>,
        actor: Option<&str>,
        settings: &HotspotSettings,
        now: DateTime<Utc>,
    ) -> Result<Subscriber> {
        if !(amount_mb.is_finite() && amount_mb > 0.0) {
            return Err(HotspotError::Validation("Debt amount must be positive".into()));
        }
        let mut locked = self.db.lock_subscriber(subscriber_id).await?;
        if locked.subscriber().role == Role::Komandan {
            return Err(HotspotError::Validation(
                "Manual debt cannot be added for KOMANDAN".into(),
            ));
        }

        let date = debt_date.format("%Y-%m-%d").to_string();
        let item_id = locked
            .insert_debt_item(amount_mb, &date, note, actor, now)
            .await?;
        let manual = locked.remaining_manual_debt().await?;
        locked.subscriber_mut().manual_debt_mb = manual;
        locked
            .record(
                &MutationDetails::ManualDebt {
                    item_id,
                    amount_mb,
                    debt_date: date,
                    note: note.map(String::from),
                },
                None,
                actor,
                now,
            )
            .await?;

        if enforce_debt_limit(&mut locked, settings, now).await? {
            self.counters.incr("ledger.debt.blocked");
        }
        Ok(locked.commit().await?)
    }

    /// Pay off one manual debt item, or every debt when `item_id` is `None`.
    pub async fn apply_debt_settlement(
        &self,
        subscriber_id: &str,
        item_id: Option<&str>,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome> {
        let mut locked = self.db.lock_subscriber(subscriber_id).await?;
        if locked.already_credited(transaction_id).await? {
            let subscriber = locked.commit().await?;
            return Ok(SettlementOutcome {
                subscriber,
                applied: false,
                unblocked: false,
            });
        }

        let open = locked.open_debt_items().await?;
        let (manual_paid, auto_paid) = if let Some(item_id) = item_id {
            let paid = open
                .iter()
                .find(|i| i.id == item_id)
                .map_or(0.0, crate::storage::DebtItem::remaining_mb);
            locked.settle_debt_item(item_id, now).await?;
            let manual = locked.remaining_manual_debt().await?;
            locked.subscriber_mut().manual_debt_mb = manual;
            (paid, 0.0)
        } else {
            for item in &open {
                locked.settle_debt_item(&item.id, now).await?;
            }
            let sub = locked.subscriber_mut();
            let manual = sub.manual_debt_mb;
            let auto = sub.auto_debt_mb;
            sub.manual_debt_mb = 0.0;
            sub.purchased_mb += auto;
            sub.auto_debt_mb = 0.0;
            (manual, auto)
        };

        let sub = locked.subscriber_mut();
        let unblocked = sub.is_blocked_for_debt() && sub.total_debt_mb() <= 0.0;
        if unblocked {
            sub.is_blocked = false;
            sub.blocked_reason = None;
        }

        locked
            .record(
                &MutationDetails::DebtSettlement {
                    item_id: item_id.map(String::from),
                    manual_paid_mb: manual_paid,
                    auto_paid_mb: auto_paid,
                    unblocked,
                },
                Some(transaction_id),
                None,
                now,
            )
            .await?;
        locked.mark_credited(transaction_id, now).await?;
        let subscriber = locked.commit().await?;
        info!(subscriber_id, transaction_id, unblocked, "Debt settlement applied");
        Ok(SettlementOutcome {
            subscriber,
            applied: true,
            unblocked,
        })
    }

    /// Change role. Promotion to KOMANDAN drops every manual debt item but
    /// leaves auto debt in place and reports it back.
    pub async fn set_role(
        &self,
        subscriber_id: &str,
        role: Role,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RoleChange> {
        let mut locked = self.db.lock_subscriber(subscriber_id).await?;
        locked.subscriber_mut().role = role;

        if role != Role::Komandan {
            locked.save().await?;
            return Ok(RoleChange {
                subscriber: locked.commit().await?,
                auto_debt_mb: None,
                cleared_manual_mb: 0.0,
            });
        }

        let cleared = locked.remaining_manual_debt().await?;
        locked.delete_debt_items().await?;
        let sub = locked.subscriber_mut();
        sub.manual_debt_mb = 0.0;
        let auto = sub.auto_debt_mb;
        locked
            .record(
                &MutationDetails::ManualDebtCleared {
                    cleared_mb: cleared,
                    auto_debt_mb: auto,
                },
                None,
                actor,
                now,
            )
            .await?;
        let subscriber = locked.commit().await?;
        if auto > 0.0 {
            info!(subscriber_id, auto_debt_mb = auto, "KOMANDAN keeps auto debt, review needed");
        }
        Ok(RoleChange {
            subscriber,
            auto_debt_mb: Some(auto),
            cleared_manual_mb: cleared,
        })
    }

    /// Admin block or unblock.
    pub async fn set_blocked(
        &self,
        subscriber_id: &str,
        blocked: bool,
        reason: Option<&str>,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Subscriber> {
        let mut locked = self.db.lock_subscriber(subscriber_id).await?;
        let sub = locked.subscriber_mut();
        sub.is_blocked = blocked;
        sub.blocked_reason = if blocked {
            Some(reason.unwrap_or("admin").to_string())
        } else {
            None
        };
        locked
            .record(
                &MutationDetails::AdminBlock {
                    blocked,
                    reason: reason.map(String::from),
                },
                None,
                actor,
                now,
            )
            .await?;
        Ok(locked.commit().await?)
    }

    /// On the last day of the month, block indebted subscribers above the
    /// end-of-month threshold. Returns the ids blocked. A subscriber that
    /// fails is logged and skipped.
    pub async fn end_of_month_sweep(
        &self,
        settings: &HotspotSettings,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        if !last_day_of_month(now) {
            return Ok(Vec::new());
        }
        let mut blocked = Vec::new();
        for id in self.db.list_indebted_subscriber_ids().await? {
            match self.block_for_month_end(&id, settings, now).await {
                Ok(true) => blocked.push(id),
                Ok(false) => {}
                Err(e) => {
                    warn!(subscriber_id = %id, error = %e, "End-of-month debt check failed");
                    self.counters.incr("ledger.debt.eom_failed");
                }
            }
        }
        Ok(blocked)
    }

    async fn block_for_month_end(
        &self,
        id: &str,
        settings: &HotspotSettings,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut locked = self.db.lock_subscriber(id).await?;
        let sub = locked.subscriber_mut();
        let total = sub.total_debt_mb();
        if total <= settings.debt_eom_threshold_mb
            || sub.is_blocked
            || settings.is_debt_block_exempt(sub.role)
        {
            locked.commit().await?;
            return Ok(false);
        }
        sub.is_blocked = true;
        sub.blocked_reason = Some(BLOCK_REASON_DEBT_END_OF_MONTH.to_string());
        locked
            .record(
                &MutationDetails::DebtBlock {
                    reason: BLOCK_REASON_DEBT_END_OF_MONTH.to_string(),
                    total_debt_mb: total,
                },
                None,
                None,
                now,
            )
            .await?;
        locked.commit().await?;
        info!(subscriber_id = %id, total_debt_mb = total, "Blocked for end-of-month debt");
        self.counters.incr("ledger.debt.eom_blocked");
        Ok(true)
    }
}

/// Block when total debt reached the hard cap. True when a block was written.
async fn enforce_debt_limit(
    locked: &mut LockedSubscriber,
    settings: &HotspotSettings,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sub = locked.subscriber_mut();
    let total = sub.total_debt_mb();
    if settings.debt_limit_mb <= 0.0
        || total < settings.debt_limit_mb
        || sub.is_blocked
        || settings.is_debt_block_exempt(sub.role)
    {
        return Ok(false);
    }
    sub.is_blocked = true;
    sub.blocked_reason = Some(BLOCK_REASON_DEBT_LIMIT.to_string());
    info!(subscriber_id = %sub.id, total_debt_mb = total, "Blocked at debt limit");
    locked
        .record(
            &MutationDetails::DebtBlock {
                reason: BLOCK_REASON_DEBT_LIMIT.to_string(),
                total_debt_mb: total,
            },
            None,
            None,
            now,
        )
        .await?;
    Ok(true)
}
