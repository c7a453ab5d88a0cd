//! Configuration types.
//!
//! Everything comes from environment variables. `RelayConfig` holds the raw
//! values; `validate()` compiles them into the immutable `RelaySettings` the
//! relay loop runs with, failing fast on the first defect.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::telegram::DEFAULT_API_BASE;
use crate::error::ConfigError;
use crate::pipeline::filter::SubstitutionPolicy;
use crate::pipeline::rules::{LinkPolicy, RuleSet};
use crate::pipeline::types::ReplacementAsset;
use crate::relay::dispatcher::RetryPolicy;
use crate::relay::relay_loop::RelaySettings;

/// Relay configuration as read from the environment.
#[derive(Debug)]
pub struct RelayConfig {
    /// Bot token / session credential.
    pub session: SecretString,
    pub source: String,
    pub destination: String,
    /// Raw drop rules (`/regex/` or substring).
    pub filters: Vec<String>,
    /// Raw rewrite rules (`pattern->replacement`).
    pub rewrites: Vec<String>,
    pub replacement_image_path: PathBuf,
    pub media_substitution: bool,
    pub replace_captioned_only: bool,
    pub link_policy: LinkPolicy,
    pub rate_limit_delay: Duration,
    pub max_send_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_reauth_attempts: u32,
    /// Enables durable duplicate suppression when set.
    pub delivery_db_path: Option<PathBuf>,
    pub delivery_retention_days: i64,
    pub reset_delivery_ledger: bool,
    pub api_base: String,
}

impl RelayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let session = get("TELEGRAM_BOT_TOKEN")
            .or_else(|| get("SESSION_STRING"))
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "TELEGRAM_BOT_TOKEN".into(),
                hint: "Set it to the bot token issued by @BotFather (or SESSION_STRING).".into(),
            })?;
        let source = required(&get, "SOURCE_CHANNEL", "e.g. @source_channel or -1001234567890")?;
        let destination = required(&get, "DESTINATION_CHANNEL", "e.g. @mirror_channel")?;

        let link_policy = match get("LINK_POLICY") {
            Some(raw) => raw.parse::<LinkPolicy>().map_err(|message| ConfigError::InvalidValue {
                key: "LINK_POLICY".into(),
                message,
            })?,
            None => LinkPolicy::default(),
        };

        let max_send_attempts: u32 = parse_or(&get, "MAX_SEND_ATTEMPTS", 3)?;
        if max_send_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_SEND_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            session: SecretString::from(session),
            source,
            destination,
            filters: get("TEXT_FILTERS").map(|v| parse_list(&v)).unwrap_or_default(),
            rewrites: get("TEXT_REWRITES").map(|v| parse_list(&v)).unwrap_or_default(),
            replacement_image_path: get("REPLACEMENT_IMAGE_PATH")
                .unwrap_or_else(|| "replacement_image.png".into())
                .into(),
            media_substitution: parse_bool(&get, "MEDIA_SUBSTITUTION", true)?,
            replace_captioned_only: parse_bool(&get, "REPLACE_CAPTIONED_ONLY", true)?,
            link_policy,
            rate_limit_delay: parse_secs(&get, "RATE_LIMIT_DELAY_SECS", 3.0)?,
            max_send_attempts,
            retry_initial_delay: Duration::from_millis(parse_or(
                &get,
                "RETRY_INITIAL_DELAY_MS",
                500,
            )?),
            retry_max_delay: Duration::from_millis(parse_or(
                &get,
                "RETRY_MAX_DELAY_MS",
                30_000,
            )?),
            max_reauth_attempts: parse_or(&get, "MAX_REAUTH_ATTEMPTS", 5)?,
            delivery_db_path: get("DELIVERY_DB_PATH").map(PathBuf::from),
            delivery_retention_days: parse_or(&get, "DELIVERY_RETENTION_DAYS", 30)?,
            reset_delivery_ledger: parse_bool(&get, "RESET_DELIVERY_LEDGER", false)?,
            api_base: get("TELEGRAM_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.into()),
        })
    }

    /// Compile rules, load the replacement asset and build run settings.
    pub async fn validate(&self) -> Result<RelaySettings, ConfigError> {
        let rules =
            RuleSet::parse(&self.filters, &self.rewrites)?.with_link_policy(self.link_policy);

        let asset_path = self.replacement_image_path.display().to_string();
        let replacement = if self.media_substitution {
            let bytes = tokio::fs::read(&self.replacement_image_path)
                .await
                .map_err(|_| ConfigError::MissingReplacementAsset {
                    path: asset_path.clone(),
                })?;
            if bytes.is_empty() {
                return Err(ConfigError::MissingReplacementAsset { path: asset_path });
            }
            let file_name = self
                .replacement_image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "replacement.png".into());
            Some(ReplacementAsset::new(file_name, bytes))
        } else {
            None
        };

        Ok(RelaySettings {
            source: self.source.clone(),
            destination: self.destination.clone(),
            rules,
            media_policy: SubstitutionPolicy {
                enabled: self.media_substitution,
                captioned_only: self.replace_captioned_only,
                asset_path,
                replacement,
            },
            min_delay: self.rate_limit_delay,
            retry: RetryPolicy {
                max_attempts: self.max_send_attempts,
                initial_delay: self.retry_initial_delay,
                max_delay: self.retry_max_delay.max(self.retry_initial_delay),
                ..RetryPolicy::default()
            },
            max_reauth_attempts: self.max_reauth_attempts,
        })
    }
}

fn required(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    hint: &str,
) -> Result<String, ConfigError> {
    get(key).ok_or_else(|| ConfigError::MissingRequired {
        key: key.into(),
        hint: hint.into(),
    })
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.into(),
            message: format!("expected a boolean, got {raw:?}"),
        }),
    }
}

/// Fractional seconds, e.g. `2.5`.
fn parse_secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_or(get, key, default)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.into(),
        message: format!("{secs}: {e}"),
    })
}

/// A JSON string array, or failing that a comma-separated list.
pub fn parse_list(raw: &str) -> Vec<String> {
    if let Ok(items) = serde_json::from_str::<Vec<String>>(raw) {
        return items
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect();
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
