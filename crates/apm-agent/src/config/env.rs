//! Configuration read from `APM_*` environment variables.
//!
//! Variables are collected with figment's prefixed [`Env`] provider and
//! deserialized into [`EnvConfig`]. Values that cannot be read are logged and
//! skipped, so the rest of the environment still applies.

use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::Deserialize;

use super::log_level::LogLevel;
use super::{
    deserialize_option_lossless, deserialize_optional_bool_from_anything,
    deserialize_optional_duration_from_seconds_ignore_zero, deserialize_string_or_int, Config,
    ConfigError, ConfigSource,
};
use crate::merge_option_to_value;

pub const ENV_PREFIX: &str = "APM_";

pub const LOG_LEVEL_VAR: &str = "APM_LOG_LEVEL";
pub const APP_NAME_VAR: &str = "APM_APP_NAME";
pub const ACCOUNT_ID_VAR: &str = "APM_ACCOUNT_ID";
pub const PRIMARY_APPLICATION_ID_VAR: &str = "APM_PRIMARY_APPLICATION_ID";
pub const TRUSTED_ACCOUNT_KEY_VAR: &str = "APM_TRUSTED_ACCOUNT_KEY";
pub const DISTRIBUTED_TRACING_ENABLED_VAR: &str = "APM_DISTRIBUTED_TRACING_ENABLED";
pub const SUPPORTABILITY_METRICS_ENABLED_VAR: &str = "APM_SUPPORTABILITY_METRICS_ENABLED";
pub const HARVEST_INTERVAL_SECS_VAR: &str = "APM_HARVEST_INTERVAL_SECS";
pub const HARVEST_MAX_RETAINED_CYCLES_VAR: &str = "APM_HARVEST_MAX_RETAINED_CYCLES";
pub const MAX_METRIC_CONTEXTS_VAR: &str = "APM_MAX_METRIC_CONTEXTS";
pub const TRANSACTION_REAP_TIMEOUT_SECS_VAR: &str = "APM_TRANSACTION_REAP_TIMEOUT_SECS";

/// The `APM_*` variables, keyed by their name without the prefix.
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfig {
    pub log_level: Option<LogLevel>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub app_name: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub account_id: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub primary_application_id: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub trusted_account_key: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub distributed_tracing_enabled: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub supportability_metrics_enabled: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds_ignore_zero")]
    pub harvest_interval_secs: Option<Duration>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub harvest_max_retained_cycles: Option<u32>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub max_metric_contexts: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds_ignore_zero")]
    pub transaction_reap_timeout_secs: Option<Duration>,
}

fn merge_config(config: &mut Config, env_config: &EnvConfig) -> Result<(), ConfigError> {
    merge_option_to_value!(config, env_config, log_level);
    merge_option_to_value!(config, env_config, app_name);
    merge_option_to_value!(config, env_config, account_id);
    merge_option_to_value!(config, env_config, primary_application_id);
    merge_option_to_value!(config, env_config, trusted_account_key);
    merge_option_to_value!(config, env_config, distributed_tracing_enabled);
    merge_option_to_value!(config, env_config, supportability_metrics_enabled);
    merge_option_to_value!(config, harvest_interval, env_config, harvest_interval_secs);
    merge_option_to_value!(config, env_config, harvest_max_retained_cycles);
    merge_option_to_value!(
        config,
        transaction_reap_timeout,
        env_config,
        transaction_reap_timeout_secs
    );

    match env_config.max_metric_contexts {
        Some(0) => {
            return Err(ConfigError::ParseError(format!(
                "{MAX_METRIC_CONTEXTS_VAR}=0"
            )))
        }
        Some(value) => config.max_metric_contexts = value,
        None => {}
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        let env_config: EnvConfig = figment.extract().map_err(|e| {
            ConfigError::ParseError(format!(
                "Failed to parse config from environment variables: {e}"
            ))
        })?;
        merge_config(config, &env_config)
    }
}
