//! Persisted key/value settings (`app_configs`).
//!
//! Secrets go to `encrypted_value`, everything else to `config_value`; a
//! read prefers whichever column is non-empty, encrypted first.

use super::Database;
use anyhow::Result;

pub const KEY_API_KEY: &str = "api_key";
pub const KEY_PLATFORM: &str = "api_platform";
pub const KEY_DISCLAIMER: &str = "disclaimer_agreed";

impl Database {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT CASE WHEN COALESCE(encrypted_value, '') != '' THEN encrypted_value
                         ELSE COALESCE(config_value, '') END
             FROM app_configs WHERE config_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str, secret: bool) -> Result<()> {
        let (plain, encrypted) = if secret { ("", value) } else { (value, "") };
        sqlx::query(
            "INSERT INTO app_configs (config_key, config_value, encrypted_value) VALUES (?, ?, ?)
             ON CONFLICT(config_key) DO UPDATE SET
               config_value = excluded.config_value,
               encrypted_value = excluded.encrypted_value",
        )
        .bind(key)
        .bind(plain)
        .bind(encrypted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
