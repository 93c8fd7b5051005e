//! Device and audit queries.

use chrono::{DateTime, Utc};
use hotspot_core::db::unix_timestamp;
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::models::{AuditEvent, Device};

impl Database {
    // =========================================================================
    // Device queries
    // =========================================================================

    /// The live (not deleted) device with this MAC.
    pub async fn get_device_by_mac(&self, mac: &str) -> Result<Option<Device>, DatabaseError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE mac = ? AND deleted_at IS NULL",
        )
        .bind(mac)
        .fetch_optional(self.pool())
        .await?;
        Ok(device)
    }

    pub async fn get_device(&self, id: &str) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {id}")))
    }

    /// Every live device of a subscriber, most recently seen first.
    pub async fn list_devices(&self, subscriber_id: &str) -> Result<Vec<Device>, DatabaseError> {
        let rows = sqlx::query_as::<_, Device>(
            r"
            SELECT * FROM devices
            WHERE subscriber_id = ? AND deleted_at IS NULL
            ORDER BY last_seen_at DESC, created_at DESC
            ",
        )
        .bind(subscriber_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_authorized_devices(
        &self,
        subscriber_id: &str,
    ) -> Result<Vec<Device>, DatabaseError> {
        let rows = sqlx::query_as::<_, Device>(
            r"
            SELECT * FROM devices
            WHERE subscriber_id = ? AND deleted_at IS NULL AND is_authorized = 1
            ORDER BY last_seen_at DESC, created_at DESC
            ",
        )
        .bind(subscriber_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Authorized devices of approved subscribers, across the fleet.
    pub async fn list_fleet_devices(&self) -> Result<Vec<Device>, DatabaseError> {
        let rows = sqlx::query_as::<_, Device>(
            r"
            SELECT d.* FROM devices d
            JOIN subscribers s ON s.id = d.subscriber_id
            WHERE d.deleted_at IS NULL AND d.is_authorized = 1 AND s.approval = 'APPROVED'
            ORDER BY d.subscriber_id, d.mac
            ",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn insert_device(
        &self,
        subscriber_id: &str,
        mac: &str,
        ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Device, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r"
            INSERT INTO devices (id, subscriber_id, mac, last_ip, is_authorized, last_seen_at, created_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            ",
        )
        .bind(&id)
        .bind(subscriber_id)
        .bind(mac)
        .bind(ip)
        .bind(now.timestamp())
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        self.get_device(&id).await
    }

    /// Mark a device seen by `subscriber_id` at `ip` and (re)authorize it.
    ///
    /// Moves ownership when the subscriber differs. The byte baseline stays.
    pub async fn claim_device(
        &self,
        id: &str,
        subscriber_id: &str,
        ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Device, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE devices
            SET subscriber_id = ?, last_ip = COALESCE(?, last_ip), is_authorized = 1,
                revoked_at = NULL, last_seen_at = ?
            WHERE id = ? AND deleted_at IS NULL
            ",
        )
        .bind(subscriber_id)
        .bind(ip)
        .bind(now.timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Device {id}")));
        }
        self.get_device(id).await
    }

    pub async fn revoke_device(&self, id: &str, now: DateTime<Utc>) -> Result<Device, DatabaseError> {
        let result = sqlx::query(
            "UPDATE devices SET is_authorized = 0, revoked_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now.timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Device {id}")));
        }
        self.get_device(id).await
    }

    /// Record the IP the router currently reports for a device.
    pub async fn update_device_ip(&self, id: &str, ip: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE devices SET last_ip = ? WHERE id = ?")
            .bind(ip)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Audit queries
    // =========================================================================

    pub async fn record_audit(
        &self,
        action: &str,
        actor: Option<&str>,
        subscriber_id: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO audit_events (action, actor, subscriber_id, details, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(action)
        .bind(actor)
        .bind(subscriber_id)
        .bind(details.to_string())
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_audit_events(&self, action: &str) -> Result<Vec<AuditEvent>, DatabaseError> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events WHERE action = ? ORDER BY id",
        )
        .bind(action)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use hotspot_core::Role;

    #[tokio::test]
    async fn mac_unique_among_live_devices() {
        let db = Database::open_in_memory().await.unwrap();
        let a = db
            .create_subscriber("+6281100000001", "A", Role::User)
            .await
            .unwrap();
        let b = db
            .create_subscriber("+6281100000002", "B", Role::User)
            .await
            .unwrap();
        let now = Utc::now();

        db.insert_device(&a.id, "AA:BB:CC:DD:EE:FF", Some("10.5.50.2"), now)
            .await
            .unwrap();
        assert!(
            db.insert_device(&b.id, "AA:BB:CC:DD:EE:FF", None, now)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn claim_moves_ownership_and_keeps_baseline() {
        let db = Database::open_in_memory().await.unwrap();
        let a = db
            .create_subscriber("+6281100000001", "A", Role::User)
            .await
            .unwrap();
        let b = db
            .create_subscriber("+6281100000002", "B", Role::User)
            .await
            .unwrap();
        let now = Utc::now();

        let device = db
            .insert_device(&a.id, "AA:BB:CC:DD:EE:FF", Some("10.5.50.2"), now)
            .await
            .unwrap();
        sqlx::query("UPDATE devices SET last_bytes_total = 500 WHERE id = ?")
            .bind(&device.id)
            .execute(db.pool())
            .await
            .unwrap();
        db.revoke_device(&device.id, now).await.unwrap();
        assert!(db.list_authorized_devices(&a.id).await.unwrap().is_empty());

        let claimed = db
            .claim_device(&device.id, &b.id, None, now)
            .await
            .unwrap();
        assert_eq!(claimed.subscriber_id, b.id);
        assert!(claimed.authorized());
        assert_eq!(claimed.last_ip.as_deref(), Some("10.5.50.2"));
        assert_eq!(claimed.last_bytes_total, Some(500));
    }

    #[tokio::test]
    async fn fleet_devices_only_for_approved() {
        let db = Database::open_in_memory().await.unwrap();
        let a = db
            .create_subscriber("+6281100000001", "A", Role::User)
            .await
            .unwrap();
        db.insert_device(&a.id, "AA:BB:CC:DD:EE:01", None, Utc::now())
            .await
            .unwrap();
        assert!(db.list_fleet_devices().await.unwrap().is_empty());

        sqlx::query("UPDATE subscribers SET approval = 'APPROVED' WHERE id = ?")
            .bind(&a.id)
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(db.list_fleet_devices().await.unwrap().len(), 1);
    }
}
