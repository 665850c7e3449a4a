//! # Providers — Platform Catalogue, Token Probe, Balance
//!
//! Two reseller platforms front the same generation API. A token belongs to
//! exactly one of them; the only way to find out which is to ask each
//! platform's token-info endpoint in turn. The first platform that
//! recognises the token wins and becomes the binding used for generation
//! and balance calls.
//!
//! Each platform reports quota in its own raw units. `SheetScale` converts
//! that to "sheets" (images), the unit the client displays.

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;

const UNNAMED_TOKEN: &str = "未命名";
const BALANCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform a token is bound to. Persisted by its string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    VectorEngine,
    Aiaimi,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::VectorEngine => "vectorengine",
            Platform::Aiaimi => "aiaimi",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s.trim() {
            "vectorengine" => Some(Platform::VectorEngine),
            "aiaimi" => Some(Platform::Aiaimi),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw quota → sheets conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SheetScale {
    /// `round(q / divisor / price)`
    Rounded { divisor: f64, price: f64 },
    /// `q / divisor / price`, unrounded
    Linear { divisor: f64, price: f64 },
}

impl SheetScale {
    pub fn sheets(&self, quota: f64) -> f64 {
        match *self {
            SheetScale::Rounded { divisor, price } => (quota / divisor / price).round(),
            SheetScale::Linear { divisor, price } => quota / divisor / price,
        }
    }
}

/// What a platform reports about a token it recognises.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenInfo {
    pub name: String,
    pub remain: f64,
    pub used: f64,
    #[serde(skip)]
    pub platform: Platform,
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub platform: Platform,
    pub base_url: String,
    admin_user: String,
    admin_key: String,
    scale: SheetScale,
    probe_client: reqwest::Client,
    balance_client: reqwest::Client,
}

impl Provider {
    pub fn new(
        platform: Platform,
        base_url: &str,
        admin_user: &str,
        admin_key: &str,
        probe_timeout: Duration,
        accept_invalid_certs: bool,
        scale: SheetScale,
    ) -> Result<Self> {
        let probe_client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("failed to build probe client")?;
        let balance_client = reqwest::Client::builder()
            .timeout(BALANCE_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("failed to build balance client")?;
        Ok(Provider {
            platform,
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_user: admin_user.to_string(),
            admin_key: admin_key.to_string(),
            scale,
            probe_client,
            balance_client,
        })
    }

    /// Generation endpoint for `model` on this platform.
    pub fn generate_url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }

    /// Ask this platform whether it knows `token`.
    pub async fn probe(&self, token: &str) -> Result<TokenInfo> {
        let url = format!(
            "{}/api/token/search?keyword=&token={}",
            self.base_url,
            urlencoding::encode(token)
        );
        let resp = self
            .probe_client
            .get(&url)
            .header("new-api-user", &self.admin_user)
            .header("Authorization", &self.admin_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("token search returned {}", resp.status());
        }
        let body: Value = resp.json().await?;
        parse_token_search(&body, self.scale, self.platform)
    }

    /// Remaining dollar balance for `token`:
    /// `hard_limit_usd - total_usage / 100`.
    pub async fn balance(&self, token: &str) -> Result<f64> {
        #[derive(Deserialize)]
        struct Subscription {
            #[serde(default)]
            hard_limit_usd: f64,
        }
        #[derive(Deserialize)]
        struct Usage {
            #[serde(default)]
            total_usage: f64,
        }

        let sub: Subscription = self
            .balance_client
            .get(format!("{}/v1/dashboard/billing/subscription", self.base_url))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let tomorrow = (Local::now() + ChronoDuration::days(1)).format("%Y-%m-%d");
        let usage: Usage = self
            .balance_client
            .get(format!(
                "{}/v1/dashboard/billing/usage?start_date=2023-01-01&end_date={}",
                self.base_url, tomorrow
            ))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(sub.hard_limit_usd - usage.total_usage / 100.0)
    }
}

/// Interpret a `/api/token/search` body. Anything other than
/// `success: true` with a non-empty `data` array is a rejection.
fn parse_token_search(body: &Value, scale: SheetScale, platform: Platform) -> Result<TokenInfo> {
    if body.get("success").and_then(Value::as_bool) != Some(true) {
        bail!("token not recognised");
    }
    let Some(first) = body
        .get("data")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
    else {
        bail!("token search returned no data");
    };
    let quota = |field: &str| first.get(field).and_then(Value::as_f64).unwrap_or(0.0);
    let name = first
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .unwrap_or(UNNAMED_TOKEN)
        .to_string();
    Ok(TokenInfo {
        name,
        remain: scale.sheets(quota("remain_quota")),
        used: scale.sheets(quota("used_quota")),
        platform,
    })
}

/// All known platforms, in probe order.
#[derive(Debug, Clone)]
pub struct ProviderSet {
    providers: Vec<Provider>,
}

impl ProviderSet {
    pub fn new(providers: Vec<Provider>) -> Self {
        ProviderSet { providers }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(ProviderSet::new(vec![
            Provider::new(
                Platform::VectorEngine,
                &cfg.vectorengine_base_url,
                &cfg.vectorengine_admin_user,
                &cfg.vectorengine_admin_key,
                Duration::from_secs(5),
                false,
                SheetScale::Rounded {
                    divisor: 1_000_000.0,
                    price: 0.265,
                },
            )?,
            Provider::new(
                Platform::Aiaimi,
                &cfg.aiaimi_base_url,
                &cfg.aiaimi_admin_user,
                &cfg.aiaimi_admin_key,
                Duration::from_secs(8),
                true,
                SheetScale::Linear {
                    divisor: 500_000.0,
                    price: 1.5,
                },
            )?,
        ]))
    }

    pub fn get(&self, platform: Platform) -> Option<&Provider> {
        self.providers.iter().find(|p| p.platform == platform)
    }

    /// Probe each platform in order; the first acceptance wins.
    pub async fn probe_all(&self, token: &str) -> Option<TokenInfo> {
        for provider in &self.providers {
            match provider.probe(token).await {
                Ok(info) => {
                    info!(platform = %provider.platform, "token recognised");
                    return Some(info);
                }
                Err(e) => debug!(platform = %provider.platform, error = %e, "token probe rejected"),
            }
        }
        None
    }
}
