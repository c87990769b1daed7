// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Route timing: one [`RouteMetric`] per handled request, aggregated by
//! status code into route stats and by response type into route breakdowns.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::{bucket_time, Aggregator, Snapshot};
use crate::errors::IncompleteTimingError;
use crate::stats::TDigestStatGroups;
use crate::trace::{Breakdown, Span, Trace};

/// Root span opened for every route.
pub const ROUTE_ROOT_SPAN: &str = "request.handler";

/// Timing of one request, opened by the web framework adapter when the
/// request starts, or built from a timing the adapter already measured.
#[derive(Debug, Clone)]
pub struct RouteMetric {
    pub method: String,
    pub route: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    trace: Trace,
    measured: Option<(SystemTime, Duration)>,
}

impl RouteMetric {
    #[must_use]
    pub fn new(method: &str, route: &str) -> Self {
        RouteMetric {
            method: method.to_string(),
            route: route.to_string(),
            status_code: 0,
            content_type: None,
            trace: Trace::new(ROUTE_ROOT_SPAN),
            measured: None,
        }
    }

    /// A request timed by the caller. It has no spans, so its breakdown is
    /// charged entirely to the `other` group.
    #[must_use]
    pub fn with_timing(method: &str, route: &str, start: SystemTime, duration: Duration) -> Self {
        RouteMetric {
            measured: Some((start, duration)),
            ..RouteMetric::new(method, route)
        }
    }

    /// The shared trace, for tasks that open spans concurrently.
    #[must_use]
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    #[must_use]
    pub fn start_span(&self, name: &str) -> Span {
        self.trace.start_span(name)
    }

    pub fn finish(&self) -> Breakdown {
        self.trace.finish()
    }

    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        match self.measured {
            Some((start, _)) => start,
            None => self.trace.start_time(),
        }
    }

    pub fn duration(&self) -> Result<Duration, IncompleteTimingError> {
        match self.measured {
            Some((_, duration)) => Ok(duration),
            None => self.trace.duration(),
        }
    }

    /// Breakdown without the root span, whose exclusive time is reported as
    /// the `other` group.
    #[must_use]
    pub fn groups(&self) -> Breakdown {
        if self.measured.is_some() {
            return Breakdown::new();
        }
        let mut groups = self.trace.breakdown();
        groups.remove(ROUTE_ROOT_SPAN);
        groups
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteKey {
    pub method: String,
    pub route: String,
    pub status_code: u16,
    pub time: DateTime<Utc>,
}

impl RouteKey {
    #[must_use]
    pub fn new(metric: &RouteMetric) -> Self {
        RouteKey {
            method: metric.method.clone(),
            route: metric.route.clone(),
            status_code: metric.status_code,
            time: bucket_time(metric.start_time()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteBreakdownKey {
    pub method: String,
    pub route: String,
    pub resp_type: String,
    pub time: DateTime<Utc>,
}

impl RouteBreakdownKey {
    #[must_use]
    pub fn new(metric: &RouteMetric) -> Self {
        RouteBreakdownKey {
            method: metric.method.clone(),
            route: metric.route.clone(),
            resp_type: resp_type(metric.status_code, metric.content_type.as_deref()),
            time: bucket_time(metric.start_time()),
        }
    }
}

/// `5xx`, `4xx`, or the subtype of the content type (`json` for
/// `application/json; charset=utf-8`).
#[must_use]
pub fn resp_type(status_code: u16, content_type: Option<&str>) -> String {
    if status_code >= 500 {
        return "5xx".to_string();
    }
    if status_code >= 400 {
        return "4xx".to_string();
    }
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .filter(|mime| !mime.is_empty())
        .map(|mime| {
            mime.split_once('/')
                .map_or(mime, |(_, subtype)| subtype)
                .to_string()
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Default)]
pub struct RouteStats {
    aggregator: Aggregator<RouteKey, TDigestStatGroups>,
}

impl RouteStats {
    pub fn notify(&self, metric: &RouteMetric) -> Result<(), IncompleteTimingError> {
        let total = metric.duration()?;
        self.aggregator
            .add(RouteKey::new(metric), |stat| stat.add_duration(total));
        Ok(())
    }

    pub fn rotate(&self) -> Snapshot<RouteKey, TDigestStatGroups> {
        self.aggregator.rotate()
    }
}

#[derive(Default)]
pub struct RouteBreakdowns {
    aggregator: Aggregator<RouteBreakdownKey, TDigestStatGroups>,
}

impl RouteBreakdowns {
    pub fn notify(&self, metric: &RouteMetric) -> Result<(), IncompleteTimingError> {
        let total = metric.duration()?;
        let groups = metric.groups();
        self.aggregator.add(RouteBreakdownKey::new(metric), |stat| {
            stat.add_groups(total, &groups);
        });
        Ok(())
    }

    pub fn rotate(&self) -> Snapshot<RouteBreakdownKey, TDigestStatGroups> {
        self.aggregator.rotate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::OTHER_GROUP;
    use std::thread;

    fn finished_route(status_code: u16, content_type: Option<&str>) -> RouteMetric {
        let mut metric = RouteMetric::new("GET", "/users/:id");
        let span = metric.start_span("sql");
        thread::sleep(Duration::from_millis(5));
        span.finish();
        metric.status_code = status_code;
        metric.content_type = content_type.map(str::to_string);
        metric.finish();
        metric
    }

    #[test]
    fn test_resp_type() {
        assert_eq!(resp_type(503, Some("text/html")), "5xx");
        assert_eq!(resp_type(404, Some("application/json")), "4xx");
        assert_eq!(
            resp_type(200, Some("application/json; charset=utf-8")),
            "json"
        );
        assert_eq!(resp_type(200, Some("text/html")), "html");
        assert_eq!(resp_type(204, Some("plain")), "plain");
        assert_eq!(resp_type(200, Some("")), "unknown");
        assert_eq!(resp_type(200, None), "unknown");
    }

    #[test]
    fn test_unfinished_route_is_rejected() {
        let stats = RouteStats::default();
        let metric = RouteMetric::new("GET", "/");
        assert_eq!(
            stats.notify(&metric),
            Err(IncompleteTimingError::MissingEnd)
        );
    }

    #[test]
    fn test_groups_exclude_root() {
        let metric = finished_route(200, None);
        let groups = metric.groups();
        assert!(groups.contains_key("sql"));
        assert!(!groups.contains_key(ROUTE_ROOT_SPAN));
    }

    #[tokio::test]
    async fn test_route_stats_keyed_by_status() {
        let stats = RouteStats::default();
        stats.notify(&finished_route(200, None)).unwrap();
        stats.notify(&finished_route(200, None)).unwrap();
        stats.notify(&finished_route(500, None)).unwrap();

        let mut drained = stats.rotate().drain().await;
        drained.sort_by_key(|(key, _)| key.status_code);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0.status_code, 200);
        assert_eq!(drained[0].1.total.count, 2);
        assert_eq!(drained[0].1.group_names().count(), 0);
        assert_eq!(drained[1].0.status_code, 500);
    }

    #[tokio::test]
    async fn test_route_breakdowns_keyed_by_resp_type() {
        let breakdowns = RouteBreakdowns::default();
        breakdowns
            .notify(&finished_route(200, Some("application/json")))
            .unwrap();
        breakdowns.notify(&finished_route(201, Some("text/json"))).unwrap();

        let drained = breakdowns.rotate().drain().await;
        assert_eq!(drained.len(), 1);
        let (key, stat) = &drained[0];
        assert_eq!(key.resp_type, "json");
        assert_eq!(stat.total.count, 2);
        assert_eq!(stat.group("sql").unwrap().count, 2);
        let sql = stat.group("sql").unwrap().sum;
        let other = stat.group(OTHER_GROUP).map_or(0.0, |g| g.sum);
        assert!((sql + other - stat.total.sum).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_measured_routes_aggregate_exactly() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let stats = RouteStats::default();
        let breakdowns = RouteBreakdowns::default();
        for ms in [10, 20, 30] {
            let mut metric =
                RouteMetric::with_timing("GET", "/users", start, Duration::from_millis(ms));
            metric.status_code = 200;
            stats.notify(&metric).unwrap();
            breakdowns.notify(&metric).unwrap();
        }

        let drained = stats.rotate().drain().await;
        assert_eq!(drained.len(), 1);
        let (key, stat) = &drained[0];
        assert_eq!(key.route, "/users");
        assert_eq!(key.status_code, 200);
        assert_eq!(key.time.to_rfc3339(), "2023-11-14T22:13:00+00:00");
        assert_eq!(stat.total.count, 3);
        assert_eq!(stat.total.sum, 60.0);
        assert_eq!(stat.total.sumsq, 1400.0);

        let drained = breakdowns.rotate().drain().await;
        let (key, stat) = &drained[0];
        assert_eq!(key.resp_type, "unknown");
        assert_eq!(stat.group_names().collect::<Vec<_>>(), vec![OTHER_GROUP]);
        assert_eq!(stat.group(OTHER_GROUP).unwrap().sum, 60.0);
    }

    #[test]
    fn test_key_json_is_camel_case() {
        let metric = finished_route(200, Some("text/html"));
        let json = serde_json::to_value(RouteKey::new(&metric)).unwrap();
        assert_eq!(json["method"], "GET");
        assert_eq!(json["route"], "/users/:id");
        assert_eq!(json["statusCode"], 200);
        assert!(json["time"].as_str().unwrap().ends_with(":00Z"));

        let json = serde_json::to_value(RouteBreakdownKey::new(&metric)).unwrap();
        assert_eq!(json["respType"], "html");
    }
}
