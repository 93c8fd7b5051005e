//! Settings table queries.

use hotspot_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::SettingRow;

impl Database {
    pub async fn get_setting(&self, key: &str) -> Result<Option<SettingRow>, DatabaseError> {
        let row = sqlx::query_as::<_, SettingRow>("SELECT * FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn put_setting(
        &self,
        key: &str,
        value: &str,
        is_secret: bool,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO settings (key, value, is_secret, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                is_secret = excluded.is_secret,
                updated_at = excluded.updated_at
            ",
        )
        .bind(key)
        .bind(value)
        .bind(i64::from(is_secret))
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_settings(&self) -> Result<Vec<SettingRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, SettingRow>("SELECT * FROM settings ORDER BY key")
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_overwrites() {
        let db = Database::open_in_memory().await.unwrap();
        db.put_setting("FUP_THRESHOLD", "0.05", false).await.unwrap();
        db.put_setting("FUP_THRESHOLD", "0.1", false).await.unwrap();

        let row = db.get_setting("FUP_THRESHOLD").await.unwrap().unwrap();
        assert_eq!(row.value, "0.1");
        assert_eq!(db.list_settings().await.unwrap().len(), 1);

        assert!(db.delete_setting("FUP_THRESHOLD").await.unwrap());
        assert!(db.get_setting("FUP_THRESHOLD").await.unwrap().is_none());
    }
}
