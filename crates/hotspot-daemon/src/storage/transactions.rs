//! Payment transaction and transaction event queries.

use chrono::{DateTime, Utc};
use hotspot_core::db::unix_timestamp;
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::models::{EventSource, Transaction, TransactionEvent, TransactionStatus, event_kind};

/// Fields for a new transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction<'a> {
    pub subscriber_id: &'a str,
    pub package_id: Option<&'a str>,
    pub order_id: &'a str,
    pub amount: i64,
    pub payment_method: &'a str,
    pub debt_mb: Option<f64>,
    pub debt_item_id: Option<&'a str>,
    pub expiry_at: Option<DateTime<Utc>>,
}

/// What the provider said when the charge was created.
#[derive(Debug, Clone, Default)]
pub struct ChargeUpdate<'a> {
    pub provider_transaction_id: Option<&'a str>,
    pub payment_details: Option<&'a str>,
    pub expiry_at: Option<DateTime<Utc>>,
}

impl Database {
    pub async fn create_transaction(
        &self,
        tx: &NewTransaction<'_>,
    ) -> Result<Transaction, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO transactions
                (id, subscriber_id, package_id, order_id, amount, status, payment_method,
                 debt_mb, debt_item_id, expiry_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'UNKNOWN', ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&id)
        .bind(tx.subscriber_id)
        .bind(tx.package_id)
        .bind(tx.order_id)
        .bind(tx.amount)
        .bind(tx.payment_method)
        .bind(tx.debt_mb)
        .bind(tx.debt_item_id)
        .bind(tx.expiry_at.map(|t| t.timestamp()))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_transaction(&id).await
    }

    pub async fn get_transaction(&self, id: &str) -> Result<Transaction, DatabaseError> {
        sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Transaction {id}")))
    }

    pub async fn get_transaction_by_order(&self, order_id: &str) -> Result<Transaction, DatabaseError> {
        sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Transaction {order_id}")))
    }

    /// A still-live UNKNOWN/PENDING purchase for this (subscriber, package).
    pub async fn find_live_purchase(
        &self,
        subscriber_id: &str,
        package_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, DatabaseError> {
        let tx = sqlx::query_as::<_, Transaction>(
            r"
            SELECT * FROM transactions
            WHERE subscriber_id = ? AND package_id = ? AND status IN ('UNKNOWN', 'PENDING')
              AND (expiry_at IS NULL OR expiry_at > ?)
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )
        .bind(subscriber_id)
        .bind(package_id)
        .bind(now.timestamp())
        .fetch_optional(self.pool())
        .await?;
        Ok(tx)
    }

    /// Move a transaction to `status`.
    ///
    /// Terminal rows never move again; returns false when the row was already
    /// terminal (or already in `status`).
    pub async fn transition_transaction(
        &self,
        id: &str,
        status: TransactionStatus,
        payload: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let settled_at = (status == TransactionStatus::Success).then(|| now.timestamp());
        let result = sqlx::query(
            r"
            UPDATE transactions
            SET status = ?, last_payload = COALESCE(?, last_payload),
                settled_at = COALESCE(?, settled_at), updated_at = ?
            WHERE id = ? AND status IN ('UNKNOWN', 'PENDING') AND status != ?
            ",
        )
        .bind(status.as_str())
        .bind(payload)
        .bind(settled_at)
        .bind(now.timestamp())
        .bind(id)
        .bind(status.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_charge(
        &self,
        id: &str,
        update: &ChargeUpdate<'_>,
    ) -> Result<Transaction, DatabaseError> {
        sqlx::query(
            r"
            UPDATE transactions
            SET provider_transaction_id = COALESCE(?, provider_transaction_id),
                payment_details = COALESCE(?, payment_details),
                expiry_at = COALESCE(?, expiry_at), updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(update.provider_transaction_id)
        .bind(update.payment_details)
        .bind(update.expiry_at.map(|t| t.timestamp()))
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        self.get_transaction(id).await
    }

    pub async fn mark_effects_applied(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE transactions SET effects_applied = 1, updated_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn touch_polled(&self, id: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE transactions SET last_polled_at = ? WHERE id = ?")
            .bind(now.timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// UNKNOWN/PENDING transactions whose last poll is older than `throttle_secs`.
    pub async fn list_pollable(
        &self,
        now: DateTime<Utc>,
        throttle_secs: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let rows = sqlx::query_as::<_, Transaction>(
            r"
            SELECT * FROM transactions
            WHERE status IN ('UNKNOWN', 'PENDING')
              AND (last_polled_at IS NULL OR last_polled_at <= ?)
            ORDER BY created_at
            ",
        )
        .bind(now.timestamp() - throttle_secs)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// SUCCESS transactions without a `MIKROTIK_APPLY_SUCCESS` event.
    pub async fn list_unapplied_successes(&self) -> Result<Vec<Transaction>, DatabaseError> {
        let rows = sqlx::query_as::<_, Transaction>(
            r"
            SELECT t.* FROM transactions t
            WHERE t.status = 'SUCCESS'
              AND NOT EXISTS (
                SELECT 1 FROM transaction_events e
                WHERE e.transaction_id = t.id AND e.kind = 'MIKROTIK_APPLY_SUCCESS'
              )
            ORDER BY t.settled_at, t.created_at
            ",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // =========================================================================
    // Transaction events
    // =========================================================================

    /// Append an event. Returns false when the event was a no-op (the single
    /// `MIKROTIK_APPLY_SUCCESS` row per transaction already exists).
    pub async fn record_transaction_event(
        &self,
        transaction_id: &str,
        source: EventSource,
        kind: &str,
        status: Option<TransactionStatus>,
        payload: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            INSERT OR IGNORE INTO transaction_events
                (transaction_id, source, kind, status, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(transaction_id)
        .bind(source.as_str())
        .bind(kind)
        .bind(status.map(|s| s.as_str()))
        .bind(payload)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn has_transaction_event(
        &self,
        transaction_id: &str,
        kind: &str,
    ) -> Result<bool, DatabaseError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM transaction_events WHERE transaction_id = ? AND kind = ? LIMIT 1",
        )
        .bind(transaction_id)
        .bind(kind)
        .fetch_optional(self.pool())
        .await?;
        Ok(found.is_some())
    }

    /// Whether the order's router effect is durably recorded.
    pub async fn effect_applied_for_order(&self, order_id: &str) -> Result<bool, DatabaseError> {
        let found: Option<i64> = sqlx::query_scalar(
            r"
            SELECT e.id FROM transaction_events e
            JOIN transactions t ON t.id = e.transaction_id
            WHERE t.order_id = ? AND e.kind = ?
            LIMIT 1
            ",
        )
        .bind(order_id)
        .bind(event_kind::MIKROTIK_APPLY_SUCCESS)
        .fetch_optional(self.pool())
        .await?;
        Ok(found.is_some())
    }

    pub async fn list_transaction_events(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<TransactionEvent>, DatabaseError> {
        let rows = sqlx::query_as::<_, TransactionEvent>(
            "SELECT * FROM transaction_events WHERE transaction_id = ? ORDER BY id",
        )
        .bind(transaction_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Drop transaction events older than `cutoff` (Unix seconds).
    ///
    /// `MIKROTIK_APPLY_SUCCESS` rows are the durable effect record and stay.
    pub async fn delete_transaction_events_before(&self, cutoff: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM transaction_events WHERE created_at < ? AND kind != 'MIKROTIK_APPLY_SUCCESS'",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hotspot_core::Role;

    async fn setup() -> (Database, Transaction) {
        let db = Database::open_in_memory().await.unwrap();
        let sub = db
            .create_subscriber("+6281234567890", "Budi", Role::User)
            .await
            .unwrap();
        let tx = db
            .create_transaction(&NewTransaction {
                subscriber_id: &sub.id,
                package_id: None,
                order_id: "BD-LPSR-ABCDEF123456",
                amount: 10_000,
                payment_method: "qris",
                debt_mb: None,
                debt_item_id: None,
                expiry_at: None,
            })
            .await
            .unwrap();
        (db, tx)
    }

    #[tokio::test]
    async fn terminal_state_never_moves_backward() {
        let (db, tx) = setup().await;
        let now = Utc::now();
        assert_eq!(tx.status().unwrap(), TransactionStatus::Unknown);

        assert!(
            db.transition_transaction(&tx.id, TransactionStatus::Pending, None, now)
                .await
                .unwrap()
        );
        assert!(
            db.transition_transaction(&tx.id, TransactionStatus::Success, Some("{}"), now)
                .await
                .unwrap()
        );
        assert!(
            !db.transition_transaction(&tx.id, TransactionStatus::Expired, None, now)
                .await
                .unwrap()
        );
        assert!(
            !db.transition_transaction(&tx.id, TransactionStatus::Success, None, now)
                .await
                .unwrap()
        );

        let reloaded = db.get_transaction_by_order(&tx.order_id).await.unwrap();
        assert_eq!(reloaded.status().unwrap(), TransactionStatus::Success);
        assert!(reloaded.settled_at.is_some());
    }

    #[tokio::test]
    async fn apply_success_event_is_recorded_once() {
        let (db, tx) = setup().await;
        let first = db
            .record_transaction_event(
                &tx.id,
                EventSource::ProviderWebhook,
                event_kind::MIKROTIK_APPLY_SUCCESS,
                None,
                None,
            )
            .await
            .unwrap();
        let second = db
            .record_transaction_event(
                &tx.id,
                EventSource::ProviderPoll,
                event_kind::MIKROTIK_APPLY_SUCCESS,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        assert!(db.effect_applied_for_order(&tx.order_id).await.unwrap());
        assert_eq!(db.list_transaction_events(&tx.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unapplied_successes_are_listed() {
        let (db, tx) = setup().await;
        let now = Utc::now();
        db.transition_transaction(&tx.id, TransactionStatus::Success, None, now)
            .await
            .unwrap();
        assert_eq!(db.list_unapplied_successes().await.unwrap().len(), 1);

        db.record_transaction_event(
            &tx.id,
            EventSource::App,
            event_kind::MIKROTIK_APPLY_SUCCESS,
            None,
            None,
        )
        .await
        .unwrap();
        assert!(db.list_unapplied_successes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_throttle_respected() {
        let (db, tx) = setup().await;
        let now = Utc::now();
        assert_eq!(db.list_pollable(now, 8).await.unwrap().len(), 1);
        db.touch_polled(&tx.id, now).await.unwrap();
        assert!(db.list_pollable(now, 8).await.unwrap().is_empty());
        let later = now + chrono::Duration::seconds(9);
        assert_eq!(db.list_pollable(later, 8).await.unwrap().len(), 1);
    }
}
