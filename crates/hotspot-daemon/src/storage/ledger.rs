//! Row-locked subscriber access for quota mutations.
//!
//! [`LockedSubscriber`] holds an open write transaction. The first statement is
//! a no-op `UPDATE` on the subscriber row, which makes `SQLite` take its write
//! lock before anything is read, so two writers on one subscriber never
//! interleave. Every change made through it, including the mutation log row,
//! lands in a single commit.

use chrono::{DateTime, Utc};
use hotspot_core::db::unix_timestamp;
use hotspot_core::{QuotaState, Subscriber};
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::models::{DebtItem, Device, MutationDetails, MutationEvent, SubscriberRow};

fn json_err(e: serde_json::Error) -> DatabaseError {
    DatabaseError::Query(format!("json: {e}"))
}

/// A subscriber row held under its write lock.
pub struct LockedSubscriber {
    tx: Transaction<'static, Sqlite>,
    subscriber: Subscriber,
    before: QuotaState,
}

impl std::fmt::Debug for LockedSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedSubscriber")
            .field("subscriber", &self.subscriber.id)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Begin a write transaction and lock one subscriber row.
    pub async fn lock_subscriber(&self, id: &str) -> Result<LockedSubscriber, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let touched = sqlx::query("UPDATE subscribers SET id = id WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Subscriber {id}")));
        }

        let row = sqlx::query_as::<_, SubscriberRow>("SELECT * FROM subscribers WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let subscriber = Subscriber::try_from(row)?;
        let before = subscriber.quota_state();

        Ok(LockedSubscriber {
            tx,
            subscriber,
            before,
        })
    }

    /// Mutation log for a subscriber, oldest first.
    pub async fn list_mutations(
        &self,
        subscriber_id: &str,
    ) -> Result<Vec<MutationEvent>, DatabaseError> {
        let rows = sqlx::query_as::<_, MutationEvent>(
            "SELECT * FROM quota_mutation_events WHERE subscriber_id = ? ORDER BY id",
        )
        .bind(subscriber_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Manual debt items for a subscriber, oldest debt first.
    pub async fn list_debt_items(&self, subscriber_id: &str) -> Result<Vec<DebtItem>, DatabaseError> {
        let rows = sqlx::query_as::<_, DebtItem>(
            "SELECT * FROM quota_debt_items WHERE subscriber_id = ? ORDER BY debt_date, created_at",
        )
        .bind(subscriber_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Approved subscribers carrying any debt.
    pub async fn list_indebted_subscriber_ids(&self) -> Result<Vec<String>, DatabaseError> {
        let ids = sqlx::query_scalar::<_, String>(
            r"
            SELECT id FROM subscribers
            WHERE approval = 'APPROVED' AND (auto_debt_mb > 0 OR manual_debt_mb > 0)
            ORDER BY id
            ",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Drop mutation log rows older than `cutoff` (Unix seconds).
    pub async fn delete_mutations_before(&self, cutoff: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM quota_mutation_events WHERE created_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

impl LockedSubscriber {
    pub const fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub const fn subscriber_mut(&mut self) -> &mut Subscriber {
        &mut self.subscriber
    }

    /// Quota state as it was when the lock was taken.
    pub const fn before(&self) -> &QuotaState {
        &self.before
    }

    /// Whether a mutation with this idempotency key is already logged.
    pub async fn has_mutation(&mut self, key: &str) -> Result<bool, DatabaseError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM quota_mutation_events WHERE idempotency_key = ?")
                .bind(key)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(found.is_some())
    }

    /// Whether the ledger already credited `transaction_id`. The marker on the
    /// transaction row survives mutation log retention; the log lookup covers
    /// keys with no transaction row.
    pub async fn already_credited(&mut self, transaction_id: &str) -> Result<bool, DatabaseError> {
        let marked: Option<Option<i64>> =
            sqlx::query_scalar("SELECT ledger_applied_at FROM transactions WHERE id = ?")
                .bind(transaction_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        if marked.flatten().is_some() {
            return Ok(true);
        }
        self.has_mutation(transaction_id).await
    }

    /// Stamp the transaction as credited inside the held transaction.
    pub async fn mark_credited(
        &mut self,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE transactions SET ledger_applied_at = ? WHERE id = ? AND ledger_applied_at IS NULL",
        )
        .bind(now.timestamp())
        .bind(transaction_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Write the subscriber's mutable columns back.
    pub async fn save(&mut self) -> Result<(), DatabaseError> {
        let s = &self.subscriber;
        sqlx::query(
            r"
            UPDATE subscribers
            SET role = ?, is_blocked = ?, blocked_reason = ?, hotspot_password = ?,
                router_profile = ?, purchased_mb = ?, used_mb = ?, expiry_at = ?,
                is_unlimited = ?, manual_debt_mb = ?, auto_debt_mb = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(s.role.as_str())
        .bind(i64::from(s.is_blocked))
        .bind(&s.blocked_reason)
        .bind(&s.hotspot_password)
        .bind(&s.router_profile)
        .bind(s.purchased_mb.max(0.0))
        .bind(s.used_mb.max(0.0))
        .bind(s.expiry_at.map(|t| t.timestamp()))
        .bind(i64::from(s.is_unlimited))
        .bind(s.manual_debt_mb.max(0.0))
        .bind(s.auto_debt_mb.max(0.0))
        .bind(unix_timestamp())
        .bind(&s.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Save the row and append its mutation log entry.
    pub async fn record(
        &mut self,
        details: &MutationDetails,
        idempotency_key: Option<&str>,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.save().await?;

        let after = self.subscriber.quota_state();
        sqlx::query(
            r"
            INSERT INTO quota_mutation_events
                (subscriber_id, source, idempotency_key, before_state, after_state, details, actor, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&self.subscriber.id)
        .bind(details.source().as_str())
        .bind(idempotency_key)
        .bind(serde_json::to_string(&self.before).map_err(json_err)?)
        .bind(serde_json::to_string(&after).map_err(json_err)?)
        .bind(serde_json::to_string(details).map_err(json_err)?)
        .bind(actor)
        .bind(now.timestamp())
        .execute(&mut *self.tx)
        .await?;

        self.before = after;
        Ok(())
    }

    // =========================================================================
    // Debt items
    // =========================================================================

    pub async fn open_debt_items(&mut self) -> Result<Vec<DebtItem>, DatabaseError> {
        let rows = sqlx::query_as::<_, DebtItem>(
            r"
            SELECT * FROM quota_debt_items
            WHERE subscriber_id = ? AND paid_mb < amount_mb
            ORDER BY debt_date, created_at
            ",
        )
        .bind(&self.subscriber.id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    pub async fn insert_debt_item(
        &mut self,
        amount_mb: f64,
        debt_date: &str,
        note: Option<&str>,
        created_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r"
            INSERT INTO quota_debt_items (id, subscriber_id, amount_mb, debt_date, note, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&id)
        .bind(&self.subscriber.id)
        .bind(amount_mb)
        .bind(debt_date)
        .bind(note)
        .bind(created_by)
        .bind(now.timestamp())
        .execute(&mut *self.tx)
        .await?;
        Ok(id)
    }

    /// Mark a debt item fully paid.
    pub async fn settle_debt_item(&mut self, id: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE quota_debt_items SET paid_mb = amount_mb, paid_at = ? WHERE id = ? AND subscriber_id = ?",
        )
        .bind(now.timestamp())
        .bind(id)
        .bind(&self.subscriber.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Remove every debt item of this subscriber. Returns how many went.
    pub async fn delete_debt_items(&mut self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM quota_debt_items WHERE subscriber_id = ?")
            .bind(&self.subscriber.id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Sum of unpaid manual debt.
    pub async fn remaining_manual_debt(&mut self) -> Result<f64, DatabaseError> {
        let total: Option<f64> = sqlx::query_scalar(
            r"
            SELECT SUM(MAX(amount_mb - paid_mb, 0)) FROM quota_debt_items
            WHERE subscriber_id = ?
            ",
        )
        .bind(&self.subscriber.id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(total.unwrap_or(0.0))
    }

    // =========================================================================
    // Device byte baselines
    // =========================================================================

    /// The live device with this MAC, if this subscriber owns it.
    pub async fn owned_device(&mut self, mac: &str) -> Result<Option<Device>, DatabaseError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE mac = ? AND subscriber_id = ? AND deleted_at IS NULL",
        )
        .bind(mac)
        .bind(&self.subscriber.id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(device)
    }

    pub async fn set_device_baseline(
        &mut self,
        device_id: &str,
        bytes_total: u64,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let bytes = i64::try_from(bytes_total)
            .map_err(|_| DatabaseError::Query(format!("byte counter too large: {bytes_total}")))?;
        sqlx::query("UPDATE devices SET last_bytes_total = ?, last_bytes_at = ? WHERE id = ?")
            .bind(bytes)
            .bind(now.timestamp())
            .bind(device_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Commit every change and release the row lock.
    pub async fn commit(self) -> Result<Subscriber, DatabaseError> {
        self.tx.commit().await?;
        Ok(self.subscriber)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hotspot_core::Role;

    async fn setup() -> (Database, Subscriber) {
        let db = Database::open_in_memory().await.unwrap();
        let sub = db
            .create_subscriber("+6281234567890", "Budi", Role::User)
            .await
            .unwrap();
        (db, sub)
    }

    #[tokio::test]
    async fn record_writes_state_and_log_in_one_commit() {
        let (db, sub) = setup().await;

        let mut locked = db.lock_subscriber(&sub.id).await.unwrap();
        locked.subscriber_mut().purchased_mb = 1024.0;
        locked
            .record(
                &MutationDetails::DebtBlock {
                    reason: "test".into(),
                    total_debt_mb: 0.0,
                },
                Some("key-1"),
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(locked.has_mutation("key-1").await.unwrap());
        locked.commit().await.unwrap();

        let reloaded = db.get_subscriber(&sub.id).await.unwrap();
        assert!((reloaded.purchased_mb - 1024.0).abs() < f64::EPSILON);

        let log = db.list_mutations(&sub.id).await.unwrap();
        assert_eq!(log.len(), 1);
        let before: QuotaState = serde_json::from_str(&log[0].before_state).unwrap();
        let after: QuotaState = serde_json::from_str(&log[0].after_state).unwrap();
        assert!(before.purchased_mb.abs() < f64::EPSILON);
        assert!((after.purchased_mb - 1024.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn dropped_lock_rolls_back() {
        let (db, sub) = setup().await;
        {
            let mut locked = db.lock_subscriber(&sub.id).await.unwrap();
            locked.subscriber_mut().used_mb = 99.0;
            locked.save().await.unwrap();
        }
        let reloaded = db.get_subscriber(&sub.id).await.unwrap();
        assert!(reloaded.used_mb.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn locking_missing_subscriber_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(matches!(
            db.lock_subscriber("ghost").await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn manual_debt_sum_ignores_paid_items() {
        let (db, sub) = setup().await;
        let now = Utc::now();
        let mut locked = db.lock_subscriber(&sub.id).await.unwrap();
        let a = locked
            .insert_debt_item(100.0, "2025-01-01", None, None, now)
            .await
            .unwrap();
        locked
            .insert_debt_item(50.0, "2025-01-02", Some("router reset"), None, now)
            .await
            .unwrap();
        assert!((locked.remaining_manual_debt().await.unwrap() - 150.0).abs() < f64::EPSILON);

        locked.settle_debt_item(&a, now).await.unwrap();
        assert!((locked.remaining_manual_debt().await.unwrap() - 50.0).abs() < f64::EPSILON);
        assert_eq!(locked.open_debt_items().await.unwrap().len(), 1);
        locked.commit().await.unwrap();

        assert_eq!(db.list_debt_items(&sub.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn credit_marker_outlives_mutation_retention() {
        let (db, sub) = setup().await;
        let tx = db
            .create_transaction(&crate::storage::NewTransaction {
                subscriber_id: &sub.id,
                package_id: None,
                order_id: "BD-LPSR-RETAIN000001",
                amount: 10_000,
                payment_method: "qris",
                debt_mb: None,
                debt_item_id: None,
                expiry_at: None,
            })
            .await
            .unwrap();
        let now = Utc::now();

        let mut locked = db.lock_subscriber(&sub.id).await.unwrap();
        assert!(!locked.already_credited(&tx.id).await.unwrap());
        locked
            .record(
                &MutationDetails::DebtBlock {
                    reason: "test".into(),
                    total_debt_mb: 0.0,
                },
                Some(tx.id.as_str()),
                None,
                now,
            )
            .await
            .unwrap();
        locked.mark_credited(&tx.id, now).await.unwrap();
        locked.commit().await.unwrap();

        assert_eq!(db.delete_mutations_before(now.timestamp() + 86_400).await.unwrap(), 1);
        let mut locked = db.lock_subscriber(&sub.id).await.unwrap();
        assert!(!locked.has_mutation(&tx.id).await.unwrap());
        assert!(locked.already_credited(&tx.id).await.unwrap());
        locked.commit().await.unwrap();

        let stored = db.get_transaction(&tx.id).await.unwrap();
        assert_eq!(stored.ledger_applied_at, Some(now.timestamp()));
    }
}
