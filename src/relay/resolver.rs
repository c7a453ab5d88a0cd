//! Channel resolver: identifier → platform handle, cached for the process.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::channels::platform::{ChannelHandle, ChannelIdentifier, Platform};
use crate::error::ResolutionError;

/// A resolved channel.
///
/// Immutable once resolved; a fresh `ChannelRef` replaces it only after
/// explicit invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub raw_identifier: String,
    pub handle: ChannelHandle,
    pub title: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl ChannelRef {
    /// Title if the platform reported one, else the raw identifier.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.raw_identifier)
    }
}

/// Maps user-supplied identifiers onto channel handles.
pub struct ChannelResolver {
    platform: Arc<dyn Platform>,
    cache: HashMap<String, ChannelRef>,
}

impl ChannelResolver {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            cache: HashMap::new(),
        }
    }

    /// Resolve `identifier`, serving repeats from the cache.
    pub async fn resolve(&mut self, identifier: &str) -> Result<ChannelRef, ResolutionError> {
        let key = identifier.trim();
        if let Some(cached) = self.cache.get(key) {
            debug!(identifier = key, handle = %cached.handle, "Channel served from cache");
            return Ok(cached.clone());
        }

        let parsed = ChannelIdentifier::parse(key)?;
        let resolved = self.platform.resolve_identifier(&parsed).await?;

        let channel = ChannelRef {
            raw_identifier: key.to_string(),
            handle: resolved.handle,
            title: resolved.title,
            resolved_at: Utc::now(),
        };
        info!(
            identifier = key,
            handle = %channel.handle,
            title = channel.display_name(),
            platform = self.platform.name(),
            "Channel resolved"
        );
        self.cache.insert(key.to_string(), channel.clone());
        Ok(channel)
    }

    /// Forget a cached mapping so the next `resolve` asks the platform again.
    pub fn invalidate(&mut self, identifier: &str) -> Option<ChannelRef> {
        self.cache.remove(identifier.trim())
    }

    pub fn cached(&self, identifier: &str) -> Option<&ChannelRef> {
        self.cache.get(identifier.trim())
    }
}
