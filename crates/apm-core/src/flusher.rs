// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serializes rotated buckets and ships them to the collector.
//!
//! ```text
//!   Snapshot ──drain──> entries ──encode──> Payload ──PUT──> collector
//!                                                  │
//!                                      transient   v
//!                                              Backlog
//! ```

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::aggregator::Snapshot;
use crate::backlog::Backlog;
use crate::collector::{Collector, Payload, PayloadClass};
use crate::errors::SendError;
use crate::stats::Stat;

#[derive(Debug, Clone)]
pub struct Flusher {
    collector: Arc<Collector>,
    backlog: Arc<Backlog>,
    environment: String,
}

impl Flusher {
    #[must_use]
    pub fn new(
        collector: Arc<Collector>,
        backlog: Arc<Backlog>,
        environment: Option<String>,
    ) -> Self {
        Flusher {
            collector,
            backlog,
            environment: environment.unwrap_or_default(),
        }
    }

    /// Builds `{"environment": ..., "<collection>": entries}`.
    pub fn encode<T: Serialize>(
        &self,
        class: PayloadClass,
        entries: &[T],
    ) -> Result<Bytes, serde_json::Error> {
        let mut document = Map::new();
        document.insert(
            "environment".to_string(),
            Value::String(self.environment.clone()),
        );
        document.insert(class.collection().to_string(), serde_json::to_value(entries)?);
        serde_json::to_vec(&document).map(Bytes::from)
    }

    /// Waits for the snapshot's in-flight adds, then sends it. Empty
    /// snapshots are skipped.
    pub async fn flush_snapshot<K, S>(
        &self,
        class: PayloadClass,
        snapshot: Snapshot<K, S>,
    ) -> Result<(), SendError>
    where
        K: Serialize,
        S: Stat,
    {
        if snapshot.is_empty() {
            return Ok(());
        }
        let entries = snapshot.pack().await;
        let body = self.encode(class, &entries).map_err(|e| {
            error!("APM | failed to encode {class}, dropping them: {e}");
            SendError::Serialization(e)
        })?;
        debug!("APM | flushing {} {class} entries", entries.len());
        self.send(self.collector.payload(class, body)).await
    }

    /// Sends one payload. Transient failures go to the backlog, anything
    /// else is logged and dropped.
    pub async fn send(&self, payload: Payload) -> Result<(), SendError> {
        let class = payload.class;
        let time = Instant::now();
        match self.collector.send(&payload).await {
            Ok(()) => {
                debug!(
                    "APM | sent {class} in {} ms",
                    time.elapsed().as_millis()
                );
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!("APM | failed to send {class}, will retry: {e}");
                self.backlog.push(payload);
                Err(e)
            }
            Err(e) => {
                error!("APM | failed to send {class}: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::routes::{RouteMetric, RouteStats};
    use hashbrown::HashSet;
    use tracing_test::traced_test;

    fn flusher(host: &str) -> (Flusher, Arc<Backlog>) {
        let config = Config {
            project_id: 1,
            project_key: "key".to_string(),
            host: host.to_string(),
            ..Config::default()
        };
        let backlog = Arc::new(Backlog::new(100, HashSet::new()));
        let collector = Arc::new(Collector::new(&config).unwrap());
        (
            Flusher::new(collector, Arc::clone(&backlog), Some("test".to_string())),
            backlog,
        )
    }

    fn one_route() -> RouteStats {
        let stats = RouteStats::default();
        let mut metric = RouteMetric::new("GET", "/");
        metric.status_code = 200;
        metric.finish();
        stats.notify(&metric).unwrap();
        stats
    }

    #[test]
    fn test_encode_document() {
        let (flusher, _) = flusher("http://127.0.0.1");
        let body = flusher
            .encode(PayloadClass::QueueStats, &[serde_json::json!({"queue": "q"})])
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["environment"], "test");
        assert_eq!(json["queues"][0]["queue"], "q");
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_not_sent() {
        // nothing listens here, a request would fail
        let (flusher, backlog) = flusher("http://127.0.0.1:1");
        let stats = RouteStats::default();
        assert!(flusher
            .flush_snapshot(PayloadClass::RouteStats, stats.rotate())
            .await
            .is_ok());
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unauthorized_logs_once_and_is_not_backlogged() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/v5/projects/1/routes-stats")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let (flusher, backlog) = flusher(&server.url());

        let result = flusher
            .flush_snapshot(PayloadClass::RouteStats, one_route().rotate())
            .await;

        assert!(matches!(result, Err(SendError::Authorization)));
        assert!(backlog.is_empty());
        mock.assert_async().await;
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("project id or key is invalid"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one authorization log line, got {n}")),
            }
        });
    }

    #[tokio::test]
    async fn test_rate_limited_is_not_backlogged() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/api/v5/projects/1/routes-stats")
            .with_status(429)
            .create_async()
            .await;
        let (flusher, backlog) = flusher(&server.url());

        let result = flusher
            .flush_snapshot(PayloadClass::RouteStats, one_route().rotate())
            .await;
        assert!(matches!(result, Err(SendError::RateLimited)));
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn test_service_unavailable_is_backlogged_once() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("PUT", "/api/v5/projects/1/routes-stats")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let (flusher, backlog) = flusher(&server.url());

        let result = flusher
            .flush_snapshot(PayloadClass::RouteStats, one_route().rotate())
            .await;
        assert!(matches!(result, Err(SendError::TransientStatus(_))));
        assert_eq!(backlog.len(PayloadClass::RouteStats), 1);
        failing.assert_async().await;
        failing.remove_async().await;

        let retry = server
            .mock("PUT", "/api/v5/projects/1/routes-stats")
            .match_header("authorization", "Bearer key")
            .with_status(201)
            .expect(1)
            .create_async()
            .await;
        backlog.flush(&flusher.collector).await;
        retry.assert_async().await;
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_status_is_dropped() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/api/v5/projects/1/routes-stats")
            .with_status(400)
            .with_body("bad request")
            .create_async()
            .await;
        let (flusher, backlog) = flusher(&server.url());

        let result = flusher
            .flush_snapshot(PayloadClass::RouteStats, one_route().rotate())
            .await;
        assert!(matches!(
            result,
            Err(SendError::UnexpectedStatus { ref body, .. }) if body == "bad request"
        ));
        assert!(backlog.is_empty());
    }
}
