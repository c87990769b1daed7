// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the remote collector.
//!
//! Every payload class has its own endpoint under
//! `{host}/api/v5/projects/{project_id}/`. Responses are mapped onto
//! [`SendError`] so callers only decide whether to keep the payload:
//!
//! | status                          | outcome                      |
//! |---------------------------------|------------------------------|
//! | 2xx                             | sent                         |
//! | 401                             | `Authorization`, dropped     |
//! | 429                             | `RateLimited`, dropped       |
//! | 404, 408, 409, 410, 5xx, I/O    | transient, kept for a retry  |
//! | anything else                   | `UnexpectedStatus`, dropped  |

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use tracing::debug;

use crate::config::Config;
use crate::errors::{ConfigError, SendError};
use crate::http::get_client;

/// Kind of payload shipped to the collector. Each class has its own endpoint
/// and its own backlog queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PayloadClass {
    Notices,
    RouteStats,
    RouteBreakdowns,
    QueryStats,
    QueueStats,
}

impl PayloadClass {
    pub const ALL: [PayloadClass; 5] = [
        PayloadClass::Notices,
        PayloadClass::RouteStats,
        PayloadClass::RouteBreakdowns,
        PayloadClass::QueryStats,
        PayloadClass::QueueStats,
    ];

    /// Last path segment of the class's endpoint.
    #[must_use]
    pub fn endpoint(self) -> &'static str {
        match self {
            PayloadClass::Notices => "notices",
            PayloadClass::RouteStats => "routes-stats",
            PayloadClass::RouteBreakdowns => "routes-breakdowns",
            PayloadClass::QueryStats => "queries-stats",
            PayloadClass::QueueStats => "queues-stats",
        }
    }

    /// Key holding the list of entries in the JSON document.
    #[must_use]
    pub fn collection(self) -> &'static str {
        match self {
            PayloadClass::Notices => "notices",
            PayloadClass::RouteStats | PayloadClass::RouteBreakdowns => "routes",
            PayloadClass::QueryStats => "queries",
            PayloadClass::QueueStats => "queues",
        }
    }

    /// Notices are created, stats are replaced per bucket.
    #[must_use]
    pub fn method(self) -> Method {
        match self {
            PayloadClass::Notices => Method::POST,
            _ => Method::PUT,
        }
    }
}

impl fmt::Display for PayloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadClass::Notices => "notices",
            PayloadClass::RouteStats => "routes stats",
            PayloadClass::RouteBreakdowns => "routes breakdowns",
            PayloadClass::QueryStats => "queries stats",
            PayloadClass::QueueStats => "queues stats",
        };
        f.write_str(name)
    }
}

impl FromStr for PayloadClass {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "notices" => Ok(PayloadClass::Notices),
            "routes_stats" | "route_stats" => Ok(PayloadClass::RouteStats),
            "routes_breakdowns" | "route_breakdowns" => Ok(PayloadClass::RouteBreakdowns),
            "queries_stats" | "query_stats" => Ok(PayloadClass::QueryStats),
            "queues_stats" | "queue_stats" => Ok(PayloadClass::QueueStats),
            _ => Err(ConfigError::Invalid {
                name: "payload class",
                value: s.to_string(),
            }),
        }
    }
}

/// A serialized payload and where it goes.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub class: PayloadClass,
    pub method: Method,
    pub url: String,
    pub body: Bytes,
}

/// Maps a collector response status onto the shipping outcome.
pub fn classify(status: StatusCode, body: String) -> Result<(), SendError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED => Err(SendError::Authorization),
        StatusCode::TOO_MANY_REQUESTS => Err(SendError::RateLimited),
        StatusCode::NOT_FOUND
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::CONFLICT
        | StatusCode::GONE => Err(SendError::TransientStatus(status)),
        s if s.is_server_error() => Err(SendError::TransientStatus(status)),
        _ => Err(SendError::UnexpectedStatus { status, body }),
    }
}

#[derive(Debug, Clone)]
pub struct Collector {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl Collector {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.project_key)).map_err(
            |_| ConfigError::Invalid {
                name: "project key",
                value: "<redacted>".to_string(),
            },
        )?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Collector {
            client: get_client(config),
            base_url: format!(
                "{}/api/v5/projects/{}",
                config.host.trim_end_matches('/'),
                config.project_id
            ),
            headers,
        })
    }

    #[must_use]
    pub fn url(&self, class: PayloadClass) -> String {
        format!("{}/{}", self.base_url, class.endpoint())
    }

    /// Wraps a serialized body into a payload addressed to `class`.
    #[must_use]
    pub fn payload(&self, class: PayloadClass, body: Bytes) -> Payload {
        Payload {
            class,
            method: class.method(),
            url: self.url(class),
            body,
        }
    }

    /// Sends one payload, without retrying.
    pub async fn send(&self, payload: &Payload) -> Result<(), SendError> {
        let time = Instant::now();
        let resp = self
            .client
            .request(payload.method.clone(), &payload.url)
            .headers(self.headers.clone())
            .body(payload.body.clone())
            .send()
            .await
            .map_err(SendError::Network)?;

        let status = resp.status();
        // Only unexpected statuses carry the body into the error
        let body = match classify(status, String::new()) {
            Err(SendError::UnexpectedStatus { .. }) => resp.text().await.unwrap_or_default(),
            _ => String::new(),
        };
        debug!(
            "APM | {} {} returned {} in {} ms",
            payload.method,
            payload.url,
            status,
            time.elapsed().as_millis()
        );
        classify(status, body)
    }
}
