// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::{bucket_time, Aggregator, Snapshot};
use crate::errors::IncompleteTimingError;
use crate::stats::TDigestStatGroups;

/// One database query issued while serving a route.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryInfo {
    pub method: String,
    pub route: String,
    pub query: String,
    pub func: String,
    pub file: String,
    pub line: u32,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

impl QueryInfo {
    /// Starts timing `query` now.
    #[must_use]
    pub fn start(method: &str, route: &str, query: &str) -> Self {
        QueryInfo {
            method: method.to_string(),
            route: route.to_string(),
            query: query.to_string(),
            start_time: Some(SystemTime::now()),
            ..QueryInfo::default()
        }
    }

    pub fn finish(&mut self) {
        self.end_time = Some(SystemTime::now());
    }

    pub fn duration(&self) -> Result<Duration, IncompleteTimingError> {
        let start = self.start_time.ok_or(IncompleteTimingError::MissingStart)?;
        let end = self.end_time.ok_or(IncompleteTimingError::MissingEnd)?;
        // Wall clock may step backwards between the two reads
        Ok(end.duration_since(start).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryKey {
    pub method: String,
    pub route: String,
    pub query: String,
    #[serde(rename = "function")]
    pub func: String,
    pub file: String,
    pub line: u32,
    pub time: DateTime<Utc>,
}

impl QueryKey {
    fn new(info: &QueryInfo, start: SystemTime) -> Self {
        QueryKey {
            method: info.method.clone(),
            route: info.route.clone(),
            query: info.query.clone(),
            func: info.func.clone(),
            file: info.file.clone(),
            line: info.line,
            time: bucket_time(start),
        }
    }
}

#[derive(Default)]
pub struct QueryStats {
    aggregator: Aggregator<QueryKey, TDigestStatGroups>,
}

impl QueryStats {
    pub fn notify(&self, info: &QueryInfo) -> Result<(), IncompleteTimingError> {
        let total = info.duration()?;
        let start = info.start_time.ok_or(IncompleteTimingError::MissingStart)?;
        self.aggregator
            .add(QueryKey::new(info, start), |stat| stat.add_duration(total));
        Ok(())
    }

    pub fn rotate(&self) -> Snapshot<QueryKey, TDigestStatGroups> {
        self.aggregator.rotate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(ms: u64) -> QueryInfo {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        QueryInfo {
            method: "GET".to_string(),
            route: "/users".to_string(),
            query: "SELECT * FROM users WHERE id = ?".to_string(),
            func: "load_user".to_string(),
            file: "src/users.rs".to_string(),
            line: 42,
            start_time: Some(start),
            end_time: Some(start + Duration::from_millis(ms)),
        }
    }

    #[test]
    fn test_duration_requires_both_ends() {
        let mut info = query(10);
        assert_eq!(info.duration(), Ok(Duration::from_millis(10)));

        info.end_time = None;
        assert_eq!(info.duration(), Err(IncompleteTimingError::MissingEnd));
        info.start_time = None;
        assert_eq!(info.duration(), Err(IncompleteTimingError::MissingStart));
    }

    #[test]
    fn test_start_and_finish() {
        let mut info = QueryInfo::start("POST", "/orders", "INSERT INTO orders");
        assert_eq!(info.duration(), Err(IncompleteTimingError::MissingEnd));
        info.finish();
        assert!(info.duration().is_ok());
    }

    #[tokio::test]
    async fn test_query_stats() {
        let stats = QueryStats::default();
        for ms in [10, 20, 30] {
            stats.notify(&query(ms)).unwrap();
        }
        assert_eq!(
            stats.notify(&QueryInfo::default()),
            Err(IncompleteTimingError::MissingStart)
        );

        let entries = stats.rotate().pack().await;
        assert_eq!(entries.len(), 1);
        let json = serde_json::to_value(&entries[0]).unwrap();
        assert_eq!(json["function"], "load_user");
        assert_eq!(json["file"], "src/users.rs");
        assert_eq!(json["line"], 42);
        assert_eq!(json["time"], "2023-11-14T22:13:00Z");
        assert_eq!(json["count"], 3);
        assert_eq!(json["sum"], 60.0);
        assert_eq!(json["sumsq"], 1400.0);
    }
}
