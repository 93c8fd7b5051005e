//! Subscriber and package queries.

use hotspot_core::db::unix_timestamp;
use hotspot_core::{ApprovalStatus, Package, Role, Subscriber};
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::models::{PackageRow, SubscriberRow};

/// Fields for a new package.
#[derive(Debug, Clone)]
pub struct NewPackage<'a> {
    pub name: &'a str,
    pub price: i64,
    pub quota_gb: f64,
    pub duration_days: i64,
    pub router_profile: Option<&'a str>,
}

/// Router credentials issued on approval.
#[derive(Debug, Clone)]
pub struct Approval<'a> {
    pub hotspot_password: &'a str,
    pub router_profile: Option<&'a str>,
    pub router_server: Option<&'a str>,
    pub approved_by: Option<&'a str>,
}

impl Database {
    // =========================================================================
    // Subscriber queries
    // =========================================================================

    /// Register a subscriber. Starts PENDING.
    pub async fn create_subscriber(
        &self,
        phone: &str,
        full_name: &str,
        role: Role,
    ) -> Result<Subscriber, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO subscribers (id, phone, full_name, role, approval, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'PENDING', ?, ?)
            ",
        )
        .bind(&id)
        .bind(phone)
        .bind(full_name)
        .bind(role.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_subscriber(&id).await
    }

    pub async fn get_subscriber(&self, id: &str) -> Result<Subscriber, DatabaseError> {
        sqlx::query_as::<_, SubscriberRow>("SELECT * FROM subscribers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Subscriber {id}")))?
            .try_into()
    }

    pub async fn get_subscriber_by_phone(&self, phone: &str) -> Result<Subscriber, DatabaseError> {
        sqlx::query_as::<_, SubscriberRow>("SELECT * FROM subscribers WHERE phone = ?")
            .bind(phone)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Subscriber with phone {phone}")))?
            .try_into()
    }

    /// Subscribers with the given approval state, oldest first.
    pub async fn list_subscribers(
        &self,
        approval: ApprovalStatus,
    ) -> Result<Vec<Subscriber>, DatabaseError> {
        sqlx::query_as::<_, SubscriberRow>(
            "SELECT * FROM subscribers WHERE approval = ? ORDER BY created_at, id",
        )
        .bind(approval.as_str())
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(Subscriber::try_from)
        .collect()
    }

    pub async fn approve_subscriber(
        &self,
        id: &str,
        approval: &Approval<'_>,
    ) -> Result<Subscriber, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            r"
            UPDATE subscribers
            SET approval = 'APPROVED', hotspot_password = ?,
                router_profile = COALESCE(?, router_profile),
                router_server = COALESCE(?, router_server),
                approved_by = ?, approved_at = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(approval.hotspot_password)
        .bind(approval.router_profile)
        .bind(approval.router_server)
        .bind(approval.approved_by)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Subscriber {id}")));
        }
        self.get_subscriber(id).await
    }

    /// Remove a subscriber row. Devices, debt items and mutation events go with it.
    pub async fn delete_subscriber(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM subscribers WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_subscriber_active(&self, id: &str, active: bool) -> Result<(), DatabaseError> {
        self.update_subscriber_column(
            id,
            "UPDATE subscribers SET is_active = ?, updated_at = ? WHERE id = ?",
            i64::from(active),
        )
        .await
    }

    pub async fn set_subscriber_role(&self, id: &str, role: Role) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE subscribers SET role = ?, updated_at = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Subscriber {id}")));
        }
        Ok(())
    }

    pub async fn set_hotspot_password(&self, id: &str, password: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE subscribers SET hotspot_password = ?, updated_at = ? WHERE id = ?",
        )
        .bind(password)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Subscriber {id}")));
        }
        Ok(())
    }

    pub async fn set_router_profile(
        &self,
        id: &str,
        profile: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let result =
            sqlx::query("UPDATE subscribers SET router_profile = ?, updated_at = ? WHERE id = ?")
                .bind(profile)
                .bind(unix_timestamp())
                .bind(id)
                .execute(self.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Subscriber {id}")));
        }
        Ok(())
    }

    async fn update_subscriber_column(
        &self,
        id: &str,
        sql: &str,
        value: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Subscriber {id}")));
        }
        Ok(())
    }

    // =========================================================================
    // Package queries
    // =========================================================================

    pub async fn create_package(&self, package: &NewPackage<'_>) -> Result<Package, DatabaseError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r"
            INSERT INTO packages (id, name, price, quota_gb, duration_days, router_profile, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&id)
        .bind(package.name)
        .bind(package.price)
        .bind(package.quota_gb)
        .bind(package.duration_days)
        .bind(package.router_profile)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_package(&id).await
    }

    pub async fn get_package(&self, id: &str) -> Result<Package, DatabaseError> {
        sqlx::query_as::<_, PackageRow>("SELECT * FROM packages WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .map(Package::from)
            .ok_or_else(|| DatabaseError::NotFound(format!("Package {id}")))
    }

    /// Active packages, cheapest first.
    pub async fn list_active_packages(&self) -> Result<Vec<Package>, DatabaseError> {
        let rows = sqlx::query_as::<_, PackageRow>(
            "SELECT * FROM packages WHERE is_active = 1 ORDER BY price, name",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Package::from).collect())
    }

    pub async fn set_package_active(&self, id: &str, active: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE packages SET is_active = ? WHERE id = ?")
            .bind(i64::from(active))
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Package {id}")));
        }
        Ok(())
    }
}
