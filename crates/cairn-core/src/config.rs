//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so the engine runs with zero configuration.
//! Invalid values are logged and ignored.

use std::path::PathBuf;
use std::time::Duration;

use cairn_shared::constants::{
    MAX_SYNC_WALK, OFFLINE_TTL_SECS, PRESENCE_THRESHOLD_SECS, TYPING_EXPIRY_SECS,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding `cairn.db` and the key file.
    /// Env: `CAIRN_DATA_DIR`
    /// Default: platform data directory
    pub data_dir: Option<PathBuf>,

    /// Encrypted key file.
    /// Env: `CAIRN_KEY_FILE`
    /// Default: `<data_dir>/identity.key`
    pub key_file: Option<PathBuf>,

    /// Passphrase the key file is encrypted under.
    /// Env: `CAIRN_KEY_PASSPHRASE`
    pub key_passphrase: String,

    /// Env: `CAIRN_OFFLINE_TTL_SECS`
    pub offline_ttl: chrono::Duration,

    /// How recent a presence heartbeat must be to count as online.
    /// Env: `CAIRN_PRESENCE_THRESHOLD_SECS`
    pub presence_threshold: chrono::Duration,

    /// Env: `CAIRN_TYPING_EXPIRY_SECS`
    pub typing_expiry: chrono::Duration,

    /// Upper bound on DAG nodes pulled per conversation per sync pass.
    /// Env: `CAIRN_SYNC_WALK`
    pub max_sync_walk: usize,

    /// Pin attempts before a message is marked failed.
    /// Env: `CAIRN_PIN_RETRIES`
    pub pin_retry_limit: u32,

    /// Wait before retry N (the last entry repeats).
    pub pin_backoff: Vec<Duration>,

    /// Bound on every pin / publish / lookup.
    /// Env: `CAIRN_NETWORK_TIMEOUT_SECS`
    pub network_timeout: Duration,

    /// Env: `CAIRN_EVENT_CAPACITY`
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            key_file: None,
            key_passphrase: String::new(),
            offline_ttl: chrono::Duration::seconds(OFFLINE_TTL_SECS),
            presence_threshold: chrono::Duration::seconds(PRESENCE_THRESHOLD_SECS),
            typing_expiry: chrono::Duration::seconds(TYPING_EXPIRY_SECS),
            max_sync_walk: MAX_SYNC_WALK,
            pin_retry_limit: 5,
            pin_backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            network_timeout: Duration::from_secs(10),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("CAIRN_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Ok(path) = std::env::var("CAIRN_KEY_FILE") {
            config.key_file = Some(PathBuf::from(path));
        }

        if let Ok(passphrase) = std::env::var("CAIRN_KEY_PASSPHRASE") {
            config.key_passphrase = passphrase;
        }

        if let Some(secs) = env_number::<i64>("CAIRN_OFFLINE_TTL_SECS") {
            config.offline_ttl = chrono::Duration::seconds(secs);
        }
        if let Some(secs) = env_number::<i64>("CAIRN_PRESENCE_THRESHOLD_SECS") {
            config.presence_threshold = chrono::Duration::seconds(secs);
        }
        if let Some(secs) = env_number::<i64>("CAIRN_TYPING_EXPIRY_SECS") {
            config.typing_expiry = chrono::Duration::seconds(secs);
        }
        if let Some(n) = env_number::<usize>("CAIRN_SYNC_WALK") {
            config.max_sync_walk = n;
        }
        if let Some(n) = env_number::<u32>("CAIRN_PIN_RETRIES") {
            config.pin_retry_limit = n;
        }
        if let Some(secs) = env_number::<u64>("CAIRN_NETWORK_TIMEOUT_SECS") {
            config.network_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_number::<usize>("CAIRN_EVENT_CAPACITY") {
            config.event_capacity = n;
        }

        config
    }

    /// Data directory, falling back to the platform default.
    pub fn resolve_data_dir(&self) -> cairn_store::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => cairn_store::Database::default_data_dir(),
        }
    }

    pub fn resolve_key_file(&self) -> cairn_store::Result<PathBuf> {
        match &self.key_file {
            Some(path) => Ok(path.clone()),
            None => Ok(self.resolve_data_dir()?.join("identity.key")),
        }
    }

    /// Backoff before the retry following `attempts` failed pins.
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        let idx = (attempts.max(1) - 1) as usize;
        self.pin_backoff
            .get(idx)
            .or(self.pin_backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Parse a positive numeric env var; anything else is logged and ignored.
fn env_number<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(n) if n > T::default() => Some(n),
        _ => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.offline_ttl, chrono::Duration::days(7));
        assert_eq!(config.presence_threshold, chrono::Duration::seconds(60));
        assert_eq!(config.max_sync_walk, 100);
        assert_eq!(config.pin_retry_limit, 5);
    }

    #[test]
    fn test_backoff_schedule() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff_after(1), Duration::from_secs(5));
        assert_eq!(config.backoff_after(3), Duration::from_secs(45));
        assert_eq!(config.backoff_after(9), Duration::from_secs(300));
    }

    #[test]
    fn test_key_file_follows_data_dir() {
        let config = EngineConfig {
            data_dir: Some(PathBuf::from("/tmp/cairn-test")),
            ..EngineConfig::default()
        };
        assert_eq!(
            config.resolve_key_file().unwrap(),
            PathBuf::from("/tmp/cairn-test/identity.key")
        );
    }
}
