//! Agent configuration.
//!
//! Values start from [`Config::default`] and are overlaid by each
//! [`ConfigSource`] added to a [`ConfigBuilder`], in order. A source that
//! fails to parse some values still applies the ones it could read.

pub mod env;
pub mod log_level;

use std::fmt;
use std::time::Duration;

use apm_metrics::constants::{DEFAULT_HARVEST_INTERVAL, DEFAULT_MAX_RETAINED_CYCLES, MAX_CONTEXTS};
use serde::{Deserialize, Deserializer};
use serde_aux::prelude::deserialize_bool_from_anything;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use env::EnvConfigSource;
use log_level::LogLevel;

pub const DEFAULT_APP_NAME: &str = "My Application";

pub const DEFAULT_TRANSACTION_REAP_TIMEOUT: Duration = Duration::from_secs(600);

/// Overwrites `config.<field>` with the source's value when it is set.
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

#[derive(Error, Debug, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("invalid configuration values: {0}")]
    ParseError(String),
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            if let Err(e) = source.load(&mut self.config) {
                error!("Failed to load config: {e}");
                failed_sources += 1;
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All config sources reported errors, unparsed values keep their defaults.");
        }

        if self.config.trusted_account_key.is_empty() {
            self.config
                .trusted_account_key
                .clone_from(&self.config.account_id);
        }

        self.config.clone()
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
#[allow(clippy::module_name_repetitions)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    pub log_level: LogLevel,
    pub app_name: String,
    pub account_id: String,
    pub primary_application_id: String,
    /// Account key trusted on inbound distributed trace payloads. Falls back
    /// to `account_id` when unset.
    pub trusted_account_key: String,
    pub distributed_tracing_enabled: bool,
    pub supportability_metrics_enabled: bool,
    pub harvest_interval: Duration,
    /// Consecutive failed harvests carried forward before the data is dropped.
    pub harvest_max_retained_cycles: u32,
    pub max_metric_contexts: usize,
    /// Age after which a transaction that never ended is reaped.
    pub transaction_reap_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            app_name: DEFAULT_APP_NAME.to_string(),
            account_id: String::new(),
            primary_application_id: String::new(),
            trusted_account_key: String::new(),
            distributed_tracing_enabled: true,
            supportability_metrics_enabled: true,
            harvest_interval: DEFAULT_HARVEST_INTERVAL,
            harvest_max_retained_cycles: DEFAULT_MAX_RETAINED_CYCLES,
            max_metric_contexts: MAX_CONTEXTS,
            transaction_reap_timeout: DEFAULT_TRANSACTION_REAP_TIMEOUT,
        }
    }
}

/// Configuration from the process environment.
#[must_use]
pub fn get_config() -> Config {
    ConfigBuilder::default()
        .add_source(Box::new(EnvConfigSource))
        .build()
}

/// Strings and numbers both read as text; blank strings are unset.
pub fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s.to_string()))
            }
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        other => {
            error!("Failed to parse value, expected a string or an integer, got: {other}, ignoring");
            Ok(None)
        }
    }
}

pub fn deserialize_optional_bool_from_anything<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Value> = Option::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(value) => match deserialize_bool_from_anything(lowercase(value)) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                error!("Failed to parse bool value: {e}, ignoring");
                Ok(None)
            }
        },
    }
}

fn lowercase(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_lowercase()),
        other => other,
    }
}

/// Numbers that do not fit are logged and left unset.
pub fn deserialize_option_lossless<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match Option::<T>::deserialize(value) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            error!("Failed to deserialize optional value: {e}, ignoring");
            Ok(None)
        }
    }
}

pub fn deserialize_optional_duration_from_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Option<Duration>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds (integer or float)")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_secs(v)))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            match u64::try_from(v) {
                Ok(secs) => self.visit_u64(secs),
                Err(_) => {
                    error!("Failed to parse duration: negative durations are not allowed, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            match Duration::try_from_secs_f64(v) {
                Ok(duration) => Ok(Some(duration)),
                Err(e) => {
                    error!("Failed to parse duration {v}: {e}, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            match v.trim().parse::<f64>() {
                Ok(secs) => self.visit_f64(secs),
                Err(_) => {
                    error!("Failed to parse duration {v:?}, expected seconds, ignoring");
                    Ok(None)
                }
            }
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}

// Like deserialize_optional_duration_from_seconds(), but return None if the value is 0
pub fn deserialize_optional_duration_from_seconds_ignore_zero<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    let duration: Option<Duration> = deserialize_optional_duration_from_seconds(deserializer)?;
    if duration.is_some_and(|d| d.is_zero()) {
        return Ok(None);
    }
    Ok(duration)
}
