use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mpw_adapters::{MarketplaceCredentials, EBAY_API_BASE};
use mpw_core::AlertRule;
use rust_decimal::Decimal;
use thiserror::Error;

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Upper bound for scheduling intervals: one year.
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),
    #[error("setting {key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct MarketplaceSettings {
    pub api_base: String,
    pub marketplace_id: String,
    pub credentials: MarketplaceCredentials,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_base: String,
    pub model: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
}

/// Process-wide settings, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub marketplace: MarketplaceSettings,
    /// `None` disables price estimation.
    pub model: Option<ModelSettings>,
    /// `None` disables notifications.
    pub telegram: Option<TelegramSettings>,
    pub alert_rule: AlertRule,
    pub queries_path: PathBuf,
    pub ingest_interval: Duration,
    pub enrich_interval: Duration,
    pub estimate_batch_size: usize,
    pub candidate_cap: usize,
    pub pause: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let model = get("GEMINI_API_KEY").map(|api_key| ModelSettings {
            api_base: get("GEMINI_API_BASE").unwrap_or_else(|| GEMINI_API_BASE.to_string()),
            model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            api_key,
        });

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramSettings {
                api_base: get("TELEGRAM_API_BASE").unwrap_or_else(|| TELEGRAM_API_BASE.to_string()),
                bot_token,
                chat_id,
            }),
            _ => None,
        };

        let price_multiple: Decimal =
            parse_value("ALERT_PRICE_MULTIPLE", required("ALERT_PRICE_MULTIPLE")?)?;
        if price_multiple.is_sign_negative() {
            return Err(ConfigError::Invalid {
                key: "ALERT_PRICE_MULTIPLE",
                value: price_multiple.to_string(),
            });
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            marketplace: MarketplaceSettings {
                api_base: get("EBAY_API_BASE").unwrap_or_else(|| EBAY_API_BASE.to_string()),
                marketplace_id: get("EBAY_MARKETPLACE_ID").unwrap_or_else(|| "EBAY_GB".to_string()),
                credentials: MarketplaceCredentials {
                    client_id: required("EBAY_CLIENT_ID")?,
                    client_secret: required("EBAY_CLIENT_SECRET")?,
                },
            },
            model,
            telegram,
            alert_rule: AlertRule::new(price_multiple),
            queries_path: get("MPW_QUERIES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("queries.json")),
            ingest_interval: interval(&get, "MPW_INGEST_INTERVAL_SECS")?,
            enrich_interval: interval(&get, "MPW_ENRICH_INTERVAL_SECS")?,
            estimate_batch_size: positive(&get, "MPW_ESTIMATE_BATCH_SIZE", 20)? as usize,
            candidate_cap: positive(&get, "MPW_ENRICH_CANDIDATE_CAP", 200)? as usize,
            pause: Duration::from_millis(optional(&get, "MPW_PAUSE_MILLIS", 1000)?),
            http_timeout: Duration::from_secs(positive(&get, "MPW_HTTP_TIMEOUT_SECS", 30)?),
            user_agent: get("MPW_USER_AGENT").unwrap_or_else(|| "mpw-bot/0.1".to_string()),
        })
    }
}

/// `DATABASE_URL` alone, for commands that never reach the marketplace.
pub fn database_url_from_env() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing("DATABASE_URL"))
}

fn parse_value<T: FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid { key, value: raw })
}

fn optional<G>(get: &G, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key).map_or(Ok(default), |raw| parse_value(key, raw))
}

fn positive<G>(get: &G, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = optional(get, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn interval<G>(get: &G, key: &'static str) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs = positive(get, key, 3600)?;
    if secs > MAX_INTERVAL_SECS {
        return Err(ConfigError::Invalid {
            key,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
