// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bucketed statistics keyed by operation identity.
//!
//! Writers look the key up under a read lock and only take the write lock to
//! create a missing statistic. Before releasing the table lock a writer
//! registers itself on the table's [`InFlight`] tracker, so a rotation (which
//! takes the write lock to swap the table) either sees the writer registered
//! on the old table or the writer lands in the new one. [`Snapshot::drain`]
//! waits for the old tracker to reach zero before handing out the statistics.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::hash::Hash;
use tokio::sync::Notify;

use crate::stats::Stat;

/// Truncates a wall clock instant to the start of its minute.
#[must_use]
pub fn bucket_time(time: SystemTime) -> DateTime<Utc> {
    let time = DateTime::<Utc>::from(time);
    time.duration_trunc(TimeDelta::minutes(1)).unwrap_or(time)
}

/// Counts adds that were registered against a table but have not finished
/// updating their statistic yet.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once no add is in flight.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await is not missed
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.notify.notify_waiters();
        }
    }
}

struct Table<K, S> {
    stats: HashMap<K, Arc<Mutex<S>>>,
    in_flight: Arc<InFlight>,
}

impl<K, S> Default for Table<K, S> {
    fn default() -> Self {
        Table {
            stats: HashMap::new(),
            in_flight: Arc::new(InFlight::default()),
        }
    }
}

pub struct Aggregator<K, S> {
    table: RwLock<Table<K, S>>,
}

impl<K, S> Default for Aggregator<K, S> {
    fn default() -> Self {
        Aggregator {
            table: RwLock::new(Table::default()),
        }
    }
}

impl<K, S> Aggregator<K, S>
where
    K: Eq + Hash,
    S: Stat,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` to the statistic stored under `key` in the current
    /// bucket, creating it on first use.
    pub fn add<F>(&self, key: K, update: F)
    where
        F: FnOnce(&mut S),
    {
        let existing = {
            let table = self.table.read();
            table
                .stats
                .get(&key)
                .map(|stat| (Arc::clone(stat), table.in_flight.enter()))
        };
        let (stat, guard) = match existing {
            Some(found) => found,
            None => {
                let mut table = self.table.write();
                // Another writer may have created it between the two locks
                let stat = Arc::clone(table.stats.entry(key).or_default());
                (stat, table.in_flight.enter())
            }
        };

        update(&mut stat.lock());
        // The statistic must be released before the tracker so the drained
        // snapshot holds the only reference
        drop(stat);
        drop(guard);
    }

    /// Swaps the current bucket for an empty one.
    pub fn rotate(&self) -> Snapshot<K, S> {
        let old = mem::take(&mut *self.table.write());
        Snapshot {
            stats: old.stats,
            in_flight: old.in_flight,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().stats.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rotated-out bucket.
pub struct Snapshot<K, S> {
    stats: HashMap<K, Arc<Mutex<S>>>,
    in_flight: Arc<InFlight>,
}

impl<K, S: Stat> Snapshot<K, S> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Waits for every add registered against this bucket, then returns its
    /// statistics.
    pub async fn drain(self) -> Vec<(K, S)> {
        self.in_flight.wait().await;
        self.stats
            .into_iter()
            .map(|(key, stat)| {
                let stat = Arc::try_unwrap(stat)
                    .map(Mutex::into_inner)
                    .unwrap_or_else(|shared| mem::take(&mut *shared.lock()));
                (key, stat)
            })
            .collect()
    }

    /// Drains and packs every statistic into its wire entry.
    pub async fn pack(self) -> Vec<Entry<K, S::Packed>> {
        self.drain()
            .await
            .into_iter()
            .map(|(key, mut stat)| Entry {
                key,
                stat: stat.pack(),
            })
            .collect()
    }
}

/// One element of a collector payload: the key fields next to the statistic.
#[derive(Debug, Clone, Serialize)]
pub struct Entry<K, P> {
    #[serde(flatten)]
    pub key: K,
    #[serde(flatten)]
    pub stat: P,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TDigestStatGroups;
    use std::time::Duration;

    type TestAggregator = Aggregator<&'static str, TDigestStatGroups>;

    fn add_ms(aggregator: &TestAggregator, key: &'static str, ms: u64) {
        aggregator.add(key, |stat| stat.add_duration(Duration::from_millis(ms)));
    }

    #[test]
    fn test_bucket_time_truncates_to_minute() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_059_999);
        let bucket = bucket_time(time);
        assert_eq!(bucket.timestamp(), 1_700_000_040);
        assert_eq!(bucket.to_rfc3339(), "2023-11-14T22:14:00+00:00");
    }

    #[tokio::test]
    async fn test_same_key_shares_a_stat() {
        let aggregator = TestAggregator::new();
        add_ms(&aggregator, "GET /users", 10);
        add_ms(&aggregator, "GET /users", 20);
        add_ms(&aggregator, "POST /users", 5);
        assert_eq!(aggregator.len(), 2);

        let mut drained = aggregator.rotate().drain().await;
        drained.sort_by_key(|(key, _)| *key);
        assert_eq!(drained[0].0, "GET /users");
        assert_eq!(drained[0].1.total.count, 2);
        assert_eq!(drained[0].1.total.sum, 30.0);
        assert_eq!(drained[1].1.total.count, 1);
    }

    #[tokio::test]
    async fn test_adds_after_rotation_land_in_new_bucket() {
        let aggregator = TestAggregator::new();
        add_ms(&aggregator, "a", 1);
        let first = aggregator.rotate();
        add_ms(&aggregator, "a", 2);
        add_ms(&aggregator, "b", 3);

        let first = first.drain().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1.total.sum, 1.0);

        let second = aggregator.rotate().drain().await;
        assert_eq!(second.len(), 2);
        assert!(aggregator.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_adds() {
        let aggregator = TestAggregator::new();
        add_ms(&aggregator, "a", 1);

        let guard = aggregator.table.read().in_flight.enter();
        let snapshot = aggregator.rotate();
        let drain = tokio::spawn(snapshot.drain());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());

        drop(guard);
        let drained = tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("drain did not complete")
            .unwrap();
        assert_eq!(drained.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_snapshot_drains_immediately() {
        let aggregator = TestAggregator::new();
        let snapshot = aggregator.rotate();
        assert!(snapshot.is_empty());
        assert!(snapshot.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds_and_rotations_lose_nothing() {
        let aggregator = Arc::new(TestAggregator::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        add_ms(&aggregator, if i % 2 == 0 { "even" } else { "odd" }, 1);
                    }
                })
            })
            .collect();

        let mut total = 0;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            for (_, stat) in aggregator.rotate().drain().await {
                total += stat.total.count;
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
        for (_, stat) in aggregator.rotate().drain().await {
            total += stat.total.count;
        }
        assert_eq!(total, 2000);
    }

    #[tokio::test]
    async fn test_pack_flattens_key_and_stat() {
        #[derive(PartialEq, Eq, Hash, Serialize)]
        struct Key {
            queue: &'static str,
        }

        let aggregator = Aggregator::<Key, TDigestStatGroups>::new();
        aggregator.add(Key { queue: "mailer" }, |stat| {
            stat.add_duration(Duration::from_millis(7));
        });
        let entries = aggregator.rotate().pack().await;
        let json = serde_json::to_value(&entries).unwrap();

        assert_eq!(json[0]["queue"], "mailer");
        assert_eq!(json[0]["count"], 1);
        assert_eq!(json[0]["sum"], 7.0);
        assert!(json[0]["tdigest"].is_string());
    }
}
