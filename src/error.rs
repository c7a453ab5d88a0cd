//! Error types for the channel relay.

use std::time::Duration;

/// Configuration-related errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid filter rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Media substitution is enabled but the replacement asset is missing: {path}")]
    MissingReplacementAsset { path: String },

    #[error("Could not resolve {role} channel: {source}")]
    Unresolvable {
        role: ChannelRole,
        #[source]
        source: ResolutionError,
    },
}

/// Which side of the relay a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Source,
    Destination,
}

impl std::fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Destination => f.write_str("destination"),
        }
    }
}

/// Failure to map a user-supplied identifier onto a platform channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("Channel {identifier} not found")]
    NotFound { identifier: String },

    #[error("Access to channel {identifier} denied (is the account a member?)")]
    AccessDenied { identifier: String },

    #[error("Identifier {identifier} matches more than one channel")]
    Ambiguous { identifier: String },

    #[error("Could not reach the platform while resolving {identifier}: {reason}")]
    Transport { identifier: String, reason: String },
}

/// Errors raised by a single outbound send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Flood wait: sends suspended for {cooldown:?}")]
    FloodWait { cooldown: Duration },

    #[error("Transient send failure: {0}")]
    Transient(String),

    #[error("Permanent send failure: {0}")]
    Permanent(String),

    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    #[error("Session invalidated")]
    SessionInvalidated,
}

/// Platform collaborator failures outside of a single send.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Subscription to channel {channel} failed: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    #[error("Session invalidated: {reason}")]
    SessionInvalidated { reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Process-fatal outcomes of the relay loop.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Reauthentication failed after {attempts} attempts")]
    ReauthenticationExhausted { attempts: u32 },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}
