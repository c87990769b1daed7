// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-key statistics: count, sum, sum of squares and a t-digest, optionally
//! split into named groups.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::digest::TDigest;
use crate::trace::Breakdown;

/// Group receiving the time not covered by any recorded span.
pub const OTHER_GROUP: &str = "other";

/// A statistic that can be packed into its wire form.
pub trait Stat: Default + Send + 'static {
    type Packed: Serialize + Send + 'static;

    /// Compresses the digests and returns the serializable form.
    fn pack(&mut self) -> Self::Packed;
}

pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_secs() as f64 * 1000.0 + f64::from(d.subsec_nanos()) / 1_000_000.0
}

#[derive(Debug, Default, Clone)]
pub struct TDigestStat {
    pub count: u64,
    pub sum: f64,
    pub sumsq: f64,
    digest: TDigest,
}

impl TDigestStat {
    /// Adds one sample in milliseconds.
    pub fn add(&mut self, ms: f64) {
        self.count += 1;
        self.sum += ms;
        self.sumsq += ms * ms;
        self.digest.add(ms);
    }

    pub fn add_duration(&mut self, d: Duration) {
        self.add(duration_ms(d));
    }

    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        self.digest.quantile(q)
    }

    #[must_use]
    pub fn pack(&mut self) -> PackedStat {
        PackedStat {
            count: self.count,
            sum: self.sum,
            sumsq: self.sumsq,
            tdigest: self.digest.as_bytes(),
        }
    }
}

/// Wire form of [`TDigestStat`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackedStat {
    pub count: u64,
    pub sum: f64,
    pub sumsq: f64,
    #[serde(serialize_with = "as_base64")]
    pub tdigest: Vec<u8>,
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// A total plus one nested statistic per span group. Statistics without
/// groups serialize exactly like a [`TDigestStat`].
#[derive(Debug, Default, Clone)]
pub struct TDigestStatGroups {
    pub total: TDigestStat,
    groups: BTreeMap<String, TDigestStat>,
}

impl TDigestStatGroups {
    /// Adds an ungrouped sample.
    pub fn add_duration(&mut self, total: Duration) {
        self.total.add_duration(total);
    }

    /// Adds a total and its breakdown. Time not covered by the breakdown is
    /// charged to [`OTHER_GROUP`]; a breakdown exceeding the total is logged
    /// and nothing is charged.
    pub fn add_groups(&mut self, total: Duration, groups: &Breakdown) {
        let total_ms = duration_ms(total);
        self.total.add(total_ms);

        let mut covered = 0.0;
        for (name, d) in groups {
            let ms = duration_ms(*d);
            covered += ms;
            self.groups.entry(name.clone()).or_default().add(ms);
        }

        let other = total_ms - covered;
        if other > 0.0 {
            self.groups
                .entry(OTHER_GROUP.to_string())
                .or_default()
                .add(other);
        } else if other < 0.0 {
            warn!(
                "APM | span groups exceed the total by {:.3}ms (total={:.3}ms), skipping {OTHER_GROUP}",
                -other, total_ms
            );
        }
    }

    #[must_use]
    pub fn group(&self, name: &str) -> Option<&TDigestStat> {
        self.groups.get(name)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackedStatGroups {
    #[serde(flatten)]
    pub total: PackedStat,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, PackedStat>,
}

impl Stat for TDigestStatGroups {
    type Packed = PackedStatGroups;

    fn pack(&mut self) -> PackedStatGroups {
        PackedStatGroups {
            total: self.total.pack(),
            groups: self
                .groups
                .iter_mut()
                .map(|(name, stat)| (name.clone(), stat.pack()))
                .collect(),
        }
    }
}
