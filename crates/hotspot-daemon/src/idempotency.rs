//! Duplicate suppression for payment notifications and effects.
//!
//! Two tiers: the fast cache answers first, the transaction event log is the
//! durable record. When the cache is unreachable every check falls back to the
//! event log and `payment.idempotency.redis_unavailable` is counted.

use std::sync::Arc;
use std::time::Duration;

use hotspot_core::Counters;
use tracing::warn;

use crate::cache::{KvCache, bounded};
use crate::error::Result;
use crate::storage::Database;

pub const WEBHOOK_TTL: Duration = Duration::from_secs(24 * 3600);
pub const EFFECT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);
pub const EFFECT_DONE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

const CACHE_DOWN: &str = "payment.idempotency.redis_unavailable";

/// Outcome of claiming a webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    /// First delivery of this tuple.
    Claimed,
    /// Seen within the TTL.
    Duplicate,
    /// Cache down; the caller proceeds and relies on the effect gate.
    Unchecked,
}

/// Outcome of asking to run an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectGate {
    Proceed { lock_held: bool },
    AlreadyDone,
    /// Another worker holds the lock.
    Busy,
}

/// `provider:order_id:transaction_status:status_code:transaction_id`
pub fn webhook_key(
    provider: &str,
    order_id: &str,
    transaction_status: &str,
    status_code: &str,
    transaction_id: &str,
) -> String {
    format!("{provider}:{order_id}:{transaction_status}:{status_code}:{transaction_id}")
}

#[derive(Clone)]
pub struct Idempotency {
    cache: Arc<dyn KvCache>,
    db: Database,
    counters: Counters,
}

impl std::fmt::Debug for Idempotency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idempotency").finish_non_exhaustive()
    }
}

impl Idempotency {
    pub fn new(cache: Arc<dyn KvCache>, db: Database, counters: Counters) -> Self {
        Self { cache, db, counters }
    }

    fn lock_key(order_id: &str, effect: &str) -> String {
        format!("effect:lock:{order_id}:{effect}")
    }

    fn done_key(order_id: &str, effect: &str) -> String {
        format!("effect:done:{order_id}:{effect}")
    }

    fn cache_down(&self, what: &str, err: &impl std::fmt::Display) {
        warn!(error = %err, what, "Idempotency cache unavailable, using event log");
        self.counters.incr(CACHE_DOWN);
    }

    pub async fn claim_webhook(&self, key: &str) -> WebhookClaim {
        match bounded(self.cache.set_nx(&format!("webhook:{key}"), "1", WEBHOOK_TTL)).await {
            Ok(true) => WebhookClaim::Claimed,
            Ok(false) => {
                self.counters.incr("payment.webhook.duplicate");
                WebhookClaim::Duplicate
            }
            Err(e) => {
                self.cache_down("webhook", &e);
                WebhookClaim::Unchecked
            }
        }
    }

    /// Forget a webhook key so a redelivery is processed again.
    pub async fn release_webhook(&self, key: &str) {
        if let Err(e) = bounded(self.cache.delete(&format!("webhook:{key}"))).await {
            warn!(error = %e, key, "Failed to release webhook key");
        }
    }

    /// Decide whether the `(order_id, effect)` effect may run now.
    pub async fn begin_effect(&self, order_id: &str, effect: &str) -> Result<EffectGate> {
        match bounded(self.cache.get(&Self::done_key(order_id, effect))).await {
            Ok(Some(_)) => return Ok(EffectGate::AlreadyDone),
            Ok(None) => {}
            Err(e) => {
                self.cache_down("effect", &e);
                return Ok(if self.db.effect_applied_for_order(order_id).await? {
                    EffectGate::AlreadyDone
                } else {
                    EffectGate::Proceed { lock_held: false }
                });
            }
        }

        let lock_held =
            match bounded(self.cache.set_nx(&Self::lock_key(order_id, effect), "1", EFFECT_LOCK_TTL))
                .await
            {
                Ok(true) => true,
                Ok(false) => return Ok(EffectGate::Busy),
                Err(e) => {
                    self.cache_down("effect", &e);
                    false
                }
            };

        // The done marker can expire before the event log does.
        if self.db.effect_applied_for_order(order_id).await? {
            self.complete_effect(order_id, effect).await;
            return Ok(EffectGate::AlreadyDone);
        }

        Ok(EffectGate::Proceed { lock_held })
    }

    /// Effect applied: write the done marker, drop the lock.
    pub async fn complete_effect(&self, order_id: &str, effect: &str) {
        if let Err(e) = bounded(self.cache.set(&Self::done_key(order_id, effect), "1", EFFECT_DONE_TTL)).await {
            self.cache_down("effect-done", &e);
        }
        self.release_lock(order_id, effect).await;
    }

    /// Effect failed: drop the lock so a retry may proceed.
    pub async fn abort_effect(&self, order_id: &str, effect: &str) {
        self.release_lock(order_id, effect).await;
    }

    async fn release_lock(&self, order_id: &str, effect: &str) {
        if let Err(e) = bounded(self.cache.delete(&Self::lock_key(order_id, effect))).await {
            warn!(error = %e, order_id, effect, "Failed to release effect lock");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::{EventSource, NewTransaction, event_kind};
    use hotspot_core::Role;

    async fn setup() -> (Idempotency, Arc<MemoryCache>, Database, Counters) {
        let db = Database::open_in_memory().await.unwrap();
        let cache = Arc::new(MemoryCache::default());
        let counters = Counters::new();
        let idem = Idempotency::new(cache.clone(), db.clone(), counters.clone());
        (idem, cache, db, counters)
    }

    #[tokio::test]
    async fn duplicate_webhooks_are_counted() {
        let (idem, _, _, counters) = setup().await;
        let key = webhook_key("midtrans", "BD-LPSR-1", "settlement", "200", "t-1");
        assert_eq!(idem.claim_webhook(&key).await, WebhookClaim::Claimed);
        assert_eq!(idem.claim_webhook(&key).await, WebhookClaim::Duplicate);
        assert_eq!(idem.claim_webhook(&key).await, WebhookClaim::Duplicate);
        assert_eq!(counters.get("payment.webhook.duplicate"), 2);

        idem.release_webhook(&key).await;
        assert_eq!(idem.claim_webhook(&key).await, WebhookClaim::Claimed);
    }

    #[tokio::test]
    async fn effect_lock_then_done() {
        let (idem, _, _, _) = setup().await;
        assert_eq!(
            idem.begin_effect("O1", "package_apply").await.unwrap(),
            EffectGate::Proceed { lock_held: true }
        );
        assert_eq!(
            idem.begin_effect("O1", "package_apply").await.unwrap(),
            EffectGate::Busy
        );
        idem.complete_effect("O1", "package_apply").await;
        assert_eq!(
            idem.begin_effect("O1", "package_apply").await.unwrap(),
            EffectGate::AlreadyDone
        );
    }

    #[tokio::test]
    async fn aborted_effect_can_retry() {
        let (idem, _, _, _) = setup().await;
        idem.begin_effect("O2", "package_apply").await.unwrap();
        idem.abort_effect("O2", "package_apply").await;
        assert_eq!(
            idem.begin_effect("O2", "package_apply").await.unwrap(),
            EffectGate::Proceed { lock_held: true }
        );
    }

    #[tokio::test]
    async fn cache_outage_falls_back_to_event_log() {
        let (idem, cache, db, counters) = setup().await;
        let sub = db
            .create_subscriber("+6281234567890", "Budi", Role::User)
            .await
            .unwrap();
        let tx = db
            .create_transaction(&NewTransaction {
                subscriber_id: &sub.id,
                package_id: None,
                order_id: "BD-LPSR-000000000001",
                amount: 1,
                payment_method: "qris",
                debt_mb: None,
                debt_item_id: None,
                expiry_at: None,
            })
            .await
            .unwrap();

        cache.set_available(false);
        assert_eq!(
            idem.begin_effect(&tx.order_id, "package_apply").await.unwrap(),
            EffectGate::Proceed { lock_held: false }
        );

        db.record_transaction_event(
            &tx.id,
            EventSource::App,
            event_kind::MIKROTIK_APPLY_SUCCESS,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            idem.begin_effect(&tx.order_id, "package_apply").await.unwrap(),
            EffectGate::AlreadyDone
        );
        assert_eq!(counters.get(CACHE_DOWN), 2);
        assert_eq!(
            idem.claim_webhook("k").await,
            WebhookClaim::Unchecked
        );
    }
}
