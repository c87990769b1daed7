// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound HTTP client shared by the flusher and the backlog.

use std::error::Error;
use std::time::Duration;

use tracing::error;

use crate::config::Config;

/// Builds the collector client, falling back to a direct connection when the
/// proxy configuration is unusable.
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "APM | Unable to parse proxy configuration: {e}, falling back to direct connection"
            );
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!("APM | Failed to build HTTP client: {inner}, using reqwest defaults");
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(config: &Config, allow_proxy: bool) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(proxy) = &config.proxy_https {
            builder = builder.proxy(reqwest::Proxy::https(proxy.as_str())?);
        }
    }

    Ok(builder.build()?)
}
