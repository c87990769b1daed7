// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background job timing, aggregated per queue with an error count.

use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::{bucket_time, Aggregator, Snapshot};
use crate::errors::IncompleteTimingError;
use crate::stats::{PackedStatGroups, Stat, TDigestStatGroups};
use crate::trace::{Breakdown, Span, Trace};

/// Root span opened for every job.
pub const QUEUE_ROOT_SPAN: &str = "queue.handler";

#[derive(Debug, Clone)]
pub struct QueueMetric {
    pub queue: String,
    pub errored: bool,
    trace: Trace,
}

impl QueueMetric {
    #[must_use]
    pub fn new(queue: &str) -> Self {
        QueueMetric {
            queue: queue.to_string(),
            errored: false,
            trace: Trace::new(QUEUE_ROOT_SPAN),
        }
    }

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
        self.trace.start_time()
    }

    pub fn duration(&self) -> Result<Duration, IncompleteTimingError> {
        self.trace.duration()
    }

    #[must_use]
    pub fn groups(&self) -> Breakdown {
        let mut groups = self.trace.breakdown();
        groups.remove(QUEUE_ROOT_SPAN);
        groups
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueueKey {
    pub queue: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct QueueStat {
    pub stats: TDigestStatGroups,
    pub error_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackedQueueStat {
    #[serde(flatten)]
    pub stats: PackedStatGroups,
    pub error_count: u64,
}

impl Stat for QueueStat {
    type Packed = PackedQueueStat;

    fn pack(&mut self) -> PackedQueueStat {
        PackedQueueStat {
            stats: self.stats.pack(),
            error_count: self.error_count,
        }
    }
}

#[derive(Default)]
pub struct QueueStats {
    aggregator: Aggregator<QueueKey, QueueStat>,
}

impl QueueStats {
    pub fn notify(&self, metric: &QueueMetric) -> Result<(), IncompleteTimingError> {
        let total = metric.duration()?;
        let groups = metric.groups();
        let key = QueueKey {
            queue: metric.queue.clone(),
            time: bucket_time(metric.start_time()),
        };
        self.aggregator.add(key, |stat| {
            stat.stats.add_groups(total, &groups);
            if metric.errored {
                stat.error_count += 1;
            }
        });
        Ok(())
    }

    pub fn rotate(&self) -> Snapshot<QueueKey, QueueStat> {
        self.aggregator.rotate()
    }
}
