//! # Credentials — Token, Platform Binding, Disclaimer Flag
//!
//! One process-wide credential cell behind a `tokio::sync::RwLock`. Readers
//! take a cheap snapshot once per request. Writers persist to `app_configs`
//! while holding the write lock and only then update memory, so the cell
//! never shows a value the store does not have.

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::{self, Database};
use crate::providers::{Platform, ProviderSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    pub token: String,
    pub platform: Platform,
    pub disclaimer_agreed: bool,
}

impl Credential {
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }
}

pub struct CredentialStore {
    db: Database,
    cell: RwLock<Credential>,
}

impl CredentialStore {
    /// Build the cell from the environment defaults, then let persisted
    /// values override them.
    pub async fn load(db: Database, env_token: Option<&str>, env_disclaimer: bool) -> Result<Self> {
        let mut cred = Credential {
            token: env_token.unwrap_or_default().trim().to_string(),
            platform: Platform::default(),
            disclaimer_agreed: env_disclaimer,
        };
        if let Some(token) = db.get_setting(db::KEY_API_KEY).await? {
            if !token.is_empty() {
                cred.token = token;
            }
        }
        if let Some(tag) = db.get_setting(db::KEY_PLATFORM).await? {
            cred.platform = Platform::parse(&tag).unwrap_or_default();
        }
        if let Some(flag) = db.get_setting(db::KEY_DISCLAIMER).await? {
            cred.disclaimer_agreed = flag == "true" || flag == "1";
        }
        info!(
            token = %mask_for_log(&cred.token),
            platform = %cred.platform,
            disclaimer = cred.disclaimer_agreed,
            "credentials loaded"
        );
        Ok(CredentialStore {
            db,
            cell: RwLock::new(cred),
        })
    }

    pub async fn snapshot(&self) -> Credential {
        self.cell.read().await.clone()
    }

    pub async fn set_token(&self, token: &str, platform: Platform) -> Result<()> {
        let mut cell = self.cell.write().await;
        self.db.set_setting(db::KEY_API_KEY, token, true).await?;
        self.db
            .set_setting(db::KEY_PLATFORM, platform.as_str(), false)
            .await?;
        cell.token = token.to_string();
        cell.platform = platform;
        info!(token = %mask_for_log(token), platform = %platform, "api key stored");
        Ok(())
    }

    pub async fn set_platform(&self, platform: Platform) -> Result<()> {
        let mut cell = self.cell.write().await;
        self.db
            .set_setting(db::KEY_PLATFORM, platform.as_str(), false)
            .await?;
        cell.platform = platform;
        Ok(())
    }

    pub async fn set_disclaimer(&self, agreed: bool) -> Result<()> {
        let mut cell = self.cell.write().await;
        let value = if agreed { "true" } else { "false" };
        self.db.set_setting(db::KEY_DISCLAIMER, value, false).await?;
        cell.disclaimer_agreed = agreed;
        Ok(())
    }

    /// Re-probe a stored token still tagged with the default platform and
    /// rebind it if another platform claims it.
    pub async fn auto_detect(&self, providers: &ProviderSet) {
        let cred = self.snapshot().await;
        if !cred.has_token() || cred.platform != Platform::default() {
            return;
        }
        match providers.probe_all(&cred.token).await {
            Some(found) if found.platform != cred.platform => {
                match self.set_platform(found.platform).await {
                    Ok(()) => info!(platform = %found.platform, "platform auto-detected"),
                    Err(e) => warn!(error = %e, "failed to persist detected platform"),
                }
            }
            Some(_) => info!(platform = %cred.platform, "platform already correct"),
            None => info!("platform detection inconclusive, keeping default"),
        }
    }
}

/// First and last four characters, for log lines.
pub fn mask_for_log(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    match chars.len() {
        0 => "(empty)".to_string(),
        n if n <= 8 => "****".to_string(),
        n => format!(
            "{}****{}",
            chars[..4].iter().collect::<String>(),
            chars[n - 4..].iter().collect::<String>()
        ),
    }
}

/// `first8****last8` for tokens longer than 8 characters, `****` otherwise,
/// empty when there is no token.
pub fn masked_key(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    match chars.len() {
        0 => String::new(),
        n if n <= 8 => "****".to_string(),
        n => format!(
            "{}****{}",
            chars[..8].iter().collect::<String>(),
            chars[n - 8..].iter().collect::<String>()
        ),
    }
}

/// Hides only the middle four characters of tokens longer than 12
/// characters; shorter tokens are returned as is.
pub fn full_masked_key(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let n = chars.len();
    if n <= 12 {
        return token.to_string();
    }
    let (start, end) = (n / 2 - 2, n / 2 + 2);
    format!(
        "{}****{}",
        chars[..start].iter().collect::<String>(),
        chars[end..].iter().collect::<String>()
    )
}
