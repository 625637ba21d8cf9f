// BlockFetch - Resumable block-parallel HTTP downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Download configuration
//!
//! Stored as pretty JSON. Every field has a default so partial files load.

use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a worker paces re-fetching a block after a transient failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts per block; `None` retries forever
    pub max_attempts: Option<u32>,

    /// Delay before the first retry, doubled on every further attempt
    pub base_delay_ms: u64,

    /// Upper bound for the doubled delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directories scanned for unfinished checkpoints at startup
    pub search_locations: Vec<PathBuf>,

    /// Thread count used when the caller does not pick one
    pub default_threads: usize,

    /// TCP connect timeout
    pub connect_timeout_secs: u64,

    /// Total time allowed for one probe or block request, body included.
    /// A block that runs over is retried. `None` disables it. The fallback
    /// transfer is never bounded by it.
    pub request_timeout_secs: Option<u64>,

    /// TCP keepalive interval; lets a dead peer end a stalled transfer
    pub keepalive_secs: Option<u64>,

    /// User-Agent sent with every request
    pub user_agent: String,

    /// Transient failure handling for block workers
    pub retry: RetryPolicy,

    /// Finished-download catalog database, used by the CLI
    pub catalog_path: Option<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            search_locations: Vec::new(),
            default_threads: 3,
            connect_timeout_secs: 30,
            request_timeout_secs: Some(300),
            keepalive_secs: Some(60),
            user_agent: format!("blockfetch/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
            catalog_path: None,
        }
    }
}

impl DownloadConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            FetchError::ConfigurationError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.default_threads == 0 {
            return Err(FetchError::ConfigurationError(
                "default_threads must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(FetchError::ConfigurationError(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: None,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_limit() {
        assert!(RetryPolicy::default().allows(u32::MAX - 1));

        let bounded = RetryPolicy {
            max_attempts: Some(2),
            ..Default::default()
        };
        assert!(bounded.allows(1));
        assert!(!bounded.allows(2));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: DownloadConfig =
            serde_json::from_str(r#"{ "default_threads": 8 }"#).unwrap();
        assert_eq!(config.default_threads, 8);
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = DownloadConfig::default();
        config.search_locations.push(PathBuf::from("/tmp/downloads"));
        config.save(&path).unwrap();

        let loaded = DownloadConfig::load(&path).unwrap();
        assert_eq!(loaded.search_locations, config.search_locations);
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = DownloadConfig {
            default_threads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FetchError::ConfigurationError(_))));
    }
}
