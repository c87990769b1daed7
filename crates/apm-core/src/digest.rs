// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! T-digest used to summarize timing samples.
//!
//! Centroid merging and quantile estimation come from the `tdigest` crate.
//! Samples are buffered and folded into the crate's digest in batches; the
//! exact count and sum are kept next to it. This module owns the binary form
//! the collector expects.
//!
//! # Binary layout
//!
//! ```text
//! u32 BE   encoding version (2)
//! f64 BE   compression
//! u32 BE   number of centroids (n)
//! f32 BE   * n   mean of each centroid as a delta from the previous mean
//! varint   * n   weight of each centroid (unsigned LEB128)
//! ```

use serde::Deserialize;
use thiserror::Error;
use tracing::error;

/// Compression used for every statistic shipped to the collector.
pub const DEFAULT_COMPRESSION: f64 = 20.0;

const SMALL_ENCODING: u32 = 2;

/// Buffered samples per unit of compression before a merge is forced.
const BUFFER_FACTOR: f64 = 25.0;

#[derive(Debug, Error, PartialEq)]
pub enum DigestError {
    #[error("digest payload truncated at byte {0}")]
    Truncated(usize),
    #[error("unsupported digest encoding version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid digest compression {0}")]
    InvalidCompression(f64),
    #[error("varint overflow at byte {0}")]
    VarintOverflow(usize),
}

#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    inner: tdigest::TDigest,
    unmerged: Vec<f64>,
    buffer_limit: usize,
    count: u64,
    sum: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

/// Centroids as exposed by the crate's serde form.
#[derive(Deserialize)]
struct CentroidsView {
    centroids: Vec<CentroidView>,
}

#[derive(Deserialize)]
struct CentroidView {
    mean: f64,
    weight: f64,
}

impl TDigest {
    /// Creates an empty digest. Non-finite or non-positive compression falls
    /// back to [`DEFAULT_COMPRESSION`].
    #[must_use]
    pub fn new(compression: f64) -> Self {
        let compression = if compression.is_finite() && compression >= 1.0 {
            compression
        } else {
            DEFAULT_COMPRESSION
        };
        let buffer_limit = (compression * BUFFER_FACTOR).ceil() as usize;
        TDigest {
            compression,
            inner: tdigest::TDigest::new_with_size(compression.round() as usize),
            unmerged: Vec::with_capacity(buffer_limit),
            buffer_limit,
            count: 0,
            sum: 0.0,
        }
    }

    #[must_use]
    pub fn compression(&self) -> f64 {
        self.compression
    }

    /// Number of samples added, exact.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of samples added, accumulated in insertion order.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of centroids in the merged digest.
    #[must_use]
    pub fn centroid_count(&self) -> usize {
        self.centroids().len()
    }

    /// Adds one sample. NaN samples are ignored.
    pub fn add(&mut self, sample: f64) {
        if sample.is_nan() {
            return;
        }
        self.count += 1;
        self.sum += sample;
        self.unmerged.push(sample);
        if self.unmerged.len() >= self.buffer_limit {
            self.compress();
        }
    }

    /// Folds every buffered sample into the digest. Calling it again without
    /// new samples does nothing.
    pub fn compress(&mut self) {
        if self.unmerged.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.unmerged);
        self.inner = self.inner.merge_unsorted(batch);
    }

    /// Estimated value at quantile `q` in `[0, 1]`. `None` for an empty digest
    /// or an out-of-range `q`.
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=1.0).contains(&q) {
            return None;
        }
        self.compress();
        Some(self.inner.estimate_quantile(q))
    }

    /// Merges `other` into this digest.
    pub fn merge(&mut self, other: &TDigest) {
        if other.is_empty() {
            return;
        }
        let mut other = other.clone();
        other.compress();
        self.compress();

        self.inner = if self.inner.is_empty() {
            other.inner
        } else {
            tdigest::TDigest::merge_digests(vec![self.inner.clone(), other.inner])
        };
        self.count += other.count;
        self.sum += other.sum;
    }

    fn centroids(&self) -> Vec<CentroidView> {
        if self.inner.is_empty() {
            return Vec::new();
        }
        match serde_json::to_value(&self.inner).and_then(serde_json::from_value::<CentroidsView>)
        {
            Ok(view) => view.centroids,
            Err(e) => {
                error!("APM | failed to read digest centroids: {e}");
                Vec::new()
            }
        }
    }

    /// Compresses and encodes the digest.
    pub fn as_bytes(&mut self) -> Vec<u8> {
        self.compress();
        let centroids = self.centroids();

        let mut buf = Vec::with_capacity(16 + centroids.len() * 6);
        buf.extend_from_slice(&SMALL_ENCODING.to_be_bytes());
        buf.extend_from_slice(&self.compression.to_be_bytes());
        buf.extend_from_slice(&(centroids.len() as u32).to_be_bytes());

        let mut previous = 0.0;
        for centroid in &centroids {
            let delta = (centroid.mean - previous) as f32;
            buf.extend_from_slice(&delta.to_be_bytes());
            previous = centroid.mean;
        }
        for centroid in &centroids {
            encode_uvarint(&mut buf, centroid.weight.round() as u64);
        }
        buf
    }

    /// Decodes the form produced by [`TDigest::as_bytes`]. The sum is rebuilt
    /// from the centroids and is therefore approximate.
    pub fn from_bytes(bytes: &[u8]) -> Result<TDigest, DigestError> {
        let mut reader = Reader { bytes, pos: 0 };

        let version = u32::from_be_bytes(reader.take()?);
        if version != SMALL_ENCODING {
            return Err(DigestError::UnsupportedVersion(version));
        }
        let compression = f64::from_be_bytes(reader.take()?);
        if !compression.is_finite() || compression < 1.0 {
            return Err(DigestError::InvalidCompression(compression));
        }
        let n = u32::from_be_bytes(reader.take()?) as usize;

        let mut means = Vec::with_capacity(n.min(bytes.len() / 4));
        let mut previous = 0.0;
        for _ in 0..n {
            previous += f64::from(f32::from_be_bytes(reader.take()?));
            means.push(previous);
        }

        let mut centroids = Vec::with_capacity(means.len());
        let mut digest = TDigest::new(compression);
        let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
        for mean in means {
            let weight = reader.uvarint()?;
            if weight == 0 {
                continue;
            }
            digest.count += weight;
            digest.sum += mean * weight as f64;
            min = min.min(mean);
            max = max.max(mean);
            centroids.push(tdigest::Centroid::new(mean, weight as f64));
        }
        if centroids.is_empty() {
            return Ok(digest);
        }
        centroids.sort_by(|a, b| a.mean().total_cmp(&b.mean()));

        digest.inner = tdigest::TDigest::new(
            centroids,
            digest.sum,
            digest.count as f64,
            max,
            min,
            compression.round() as usize,
        );
        Ok(digest)
    }
}

fn encode_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], DigestError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DigestError::Truncated(self.pos))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    fn uvarint(&mut self) -> Result<u64, DigestError> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self
                .bytes
                .get(self.pos)
                .ok_or(DigestError::Truncated(self.pos))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(DigestError::VarintOverflow(self.pos));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}
