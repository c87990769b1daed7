// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use hashbrown::HashSet;

use crate::collector::PayloadClass;
use crate::errors::ConfigError;
use crate::filter::Blocklist;

pub const DEFAULT_HOST: &str = "https://api.airbrake.io";
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 15;
const DEFAULT_BACKLOG_FLUSH_INTERVAL_SECS: u64 = 60;
const DEFAULT_BACKLOG_MAX_SIZE: usize = 100;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub project_id: u64,
    pub project_key: String,
    pub host: String,
    pub environment: Option<String>,
    /// When set, every `notify_*` call is refused and nothing is sent.
    pub disabled: bool,
    /// how often the aggregators are rotated and sent
    pub flush_interval: Duration,
    /// how often the backlog is drained and resent
    pub backlog_flush_interval: Duration,
    /// maximum number of entries kept per payload class
    pub backlog_max_size: usize,
    /// payload classes whose failed sends are dropped instead of backlogged
    pub backlog_disabled: HashSet<PayloadClass>,
    pub request_timeout: Duration,
    pub proxy_https: Option<String>,
    pub route_blocklist: Blocklist,
    pub queue_blocklist: Blocklist,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            project_id: 0,
            project_key: String::new(),
            host: DEFAULT_HOST.to_string(),
            environment: None,
            disabled: false,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            backlog_flush_interval: Duration::from_secs(DEFAULT_BACKLOG_FLUSH_INTERVAL_SECS),
            backlog_max_size: DEFAULT_BACKLOG_MAX_SIZE,
            backlog_disabled: HashSet::new(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            proxy_https: None,
            route_blocklist: Blocklist::default(),
            queue_blocklist: Blocklist::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let project_id = env::var("APM_PROJECT_ID")
            .map_err(|_| ConfigError::Missing("APM_PROJECT_ID"))
            .and_then(|id| parse("APM_PROJECT_ID", &id))?;
        let project_key = env::var("APM_PROJECT_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::Missing("APM_PROJECT_KEY"))?;

        let defaults = Config::default();
        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            optional(name)
                .map(|v| parse::<u64>(name, &v).map(Duration::from_secs))
                .unwrap_or(Ok(default))
        };

        Ok(Config {
            project_id,
            project_key,
            host: optional("APM_HOST")
                .map(|host| host.trim_end_matches('/').to_string())
                .unwrap_or(defaults.host),
            environment: optional("APM_ENVIRONMENT"),
            disabled: optional("APM_DISABLED")
                .map(|v| parse_bool("APM_DISABLED", &v))
                .transpose()?
                .unwrap_or(false),
            flush_interval: secs("APM_FLUSH_INTERVAL_SECS", defaults.flush_interval)?,
            backlog_flush_interval: secs(
                "APM_BACKLOG_FLUSH_INTERVAL_SECS",
                defaults.backlog_flush_interval,
            )?,
            backlog_max_size: optional("APM_BACKLOG_MAX_SIZE")
                .map(|v| parse("APM_BACKLOG_MAX_SIZE", &v))
                .transpose()?
                .unwrap_or(defaults.backlog_max_size),
            backlog_disabled: optional("APM_BACKLOG_DISABLE")
                .map(|v| parse_payload_classes(&v))
                .transpose()?
                .unwrap_or_default(),
            request_timeout: secs("APM_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            proxy_https: optional("APM_PROXY_HTTPS").or_else(|| optional("HTTPS_PROXY")),
            route_blocklist: optional("APM_ROUTE_BLOCKLIST")
                .map(|v| Blocklist::from_env_string(&v))
                .transpose()?
                .unwrap_or_default(),
            queue_blocklist: optional("APM_QUEUE_BLOCKLIST")
                .map(|v| Blocklist::from_env_string(&v))
                .transpose()?
                .unwrap_or_default(),
            log_level: optional("APM_LOG_LEVEL")
                .map(|v| v.to_lowercase())
                .unwrap_or(defaults.log_level),
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

/// Comma separated payload classes, or `all`.
fn parse_payload_classes(value: &str) -> Result<HashSet<PayloadClass>, ConfigError> {
    if value.trim().eq_ignore_ascii_case("all") {
        return Ok(PayloadClass::ALL.into_iter().collect());
    }
    value
        .split(',')
        .filter(|class| !class.trim().is_empty())
        .map(str::parse)
        .collect()
}
