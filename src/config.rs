//! Aggregate runtime configuration.
//!
//! Each component owns its config struct; [`ReflexConfig`] bundles them for
//! hosts and reads overrides from `CHATREFLEX_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::TriggerCacheConfig;
use crate::error::{ReflexResult, ValidationError};
use crate::matching::MatchEngineConfig;
use crate::scheduler::SchedulerConfig;
use crate::telemetry::TelemetryConfig;

/// Environment variable names.
pub mod env {
    /// Data directory of the persistent store.
    pub const DATA_DIR: &str = "CHATREFLEX_DATA_DIR";
    /// Channel name recorded on telemetry.
    pub const CHANNEL: &str = "CHATREFLEX_CHANNEL";
    /// Trigger cache refresh interval in seconds.
    pub const REFRESH_SECS: &str = "CHATREFLEX_REFRESH_SECS";
    /// Telemetry batch size.
    pub const BATCH_SIZE: &str = "CHATREFLEX_BATCH_SIZE";
    /// Telemetry batch age in seconds.
    pub const BATCH_SECS: &str = "CHATREFLEX_BATCH_SECS";
    /// Telemetry shutdown grace period in seconds.
    pub const GRACE_SECS: &str = "CHATREFLEX_GRACE_SECS";
}

/// Settings for every component of a host.
#[derive(Debug, Clone)]
pub struct ReflexConfig {
    /// Persistent store directory, when one is used.
    pub data_dir: Option<PathBuf>,
    #[allow(missing_docs)]
    pub cache: TriggerCacheConfig,
    #[allow(missing_docs)]
    pub matching: MatchEngineConfig,
    #[allow(missing_docs)]
    pub scheduler: SchedulerConfig,
    #[allow(missing_docs)]
    pub telemetry: TelemetryConfig,
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache: TriggerCacheConfig::default(),
            matching: MatchEngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ReflexConfig {
    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    ///
    /// Fails when a variable is set but unparsable, or the result is invalid.
    pub fn from_env() -> ReflexResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(name)` for each `CHATREFLEX_*` name.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ReflexResult<Self> {
        let mut cfg = Self::default();

        if let Some(dir) = lookup(env::DATA_DIR).filter(|v| !v.trim().is_empty()) {
            cfg.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(channel) = lookup(env::CHANNEL) {
            cfg.matching.channel = channel;
        }
        if let Some(secs) = parse::<u64>(&lookup, env::REFRESH_SECS)? {
            cfg.cache.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse::<usize>(&lookup, env::BATCH_SIZE)? {
            cfg.telemetry.batch_size = size;
        }
        if let Some(secs) = parse::<u64>(&lookup, env::BATCH_SECS)? {
            cfg.telemetry.batch_time = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, env::GRACE_SECS)? {
            cfg.telemetry.grace_period = Duration::from_secs(secs);
        }

        cfg.validate()
    }

    /// Validate every component config.
    ///
    /// # Errors
    ///
    /// Returns the first component validation failure.
    pub fn validate(self) -> ReflexResult<Self> {
        Ok(Self {
            data_dir: self.data_dir,
            cache: self.cache.validate()?,
            matching: self.matching.validate()?,
            scheduler: self.scheduler.validate()?,
            telemetry: self.telemetry.validate()?,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> ReflexResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim().parse::<T>().map(Some).map_err(|e| {
        ValidationError::InvalidConfig {
            field: key.to_string(),
            reason: format!("cannot parse '{raw}': {e}"),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = ReflexConfig::from_lookup(lookup(&[])).unwrap();
        assert!(cfg.data_dir.is_none());
        assert_eq!(cfg.telemetry.batch_size, 50);
        assert_eq!(cfg.cache.refresh_interval, Duration::from_secs(1800));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = ReflexConfig::from_lookup(lookup(&[
            (env::DATA_DIR, "/tmp/reflex"),
            (env::CHANNEL, "somechannel"),
            (env::REFRESH_SECS, "30"),
            (env::BATCH_SIZE, " 10 "),
            (env::GRACE_SECS, "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/tmp/reflex")));
        assert_eq!(cfg.matching.channel, "somechannel");
        assert_eq!(cfg.cache.refresh_interval, Duration::from_secs(30));
        assert_eq!(cfg.telemetry.batch_size, 10);
        assert_eq!(cfg.telemetry.grace_period, Duration::from_secs(5));
    }

    #[test]
    fn unparsable_value_is_a_validation_error() {
        let err = ReflexConfig::from_lookup(lookup(&[(env::BATCH_SIZE, "many")])).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains(env::BATCH_SIZE));

        let err = ReflexConfig::from_lookup(lookup(&[(env::BATCH_SIZE, "0")])).unwrap_err();
        assert!(err.is_validation());
    }
}
