// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # APM core
//!
//! Times routes, queue jobs and database queries, aggregates the timings into
//! per-minute statistics and ships them to the collector.
//!
//! ## Architecture
//!
//! - [`trace`]: span timing for one unit of work, with nesting, reentry and
//!   pause/resume
//! - [`digest`]: merging t-digest used for quantiles
//! - [`stats`]: count, sum, sum of squares and digest, optionally per span
//!   group
//! - [`aggregator`]: time-bucketed concurrent map of statistics with rotation
//! - [`routes`], [`queries`], [`queues`]: the four aggregated payloads
//! - [`flusher`], [`collector`], [`backlog`]: serialization, HTTP delivery and
//!   bounded retry
//! - [`notifier`]: the facade tying them together
//!
//! ## Usage
//!
//! ```rust,ignore
//! let notifier = Notifier::from_env()?;
//! notifier.start();
//!
//! let mut metric = RouteMetric::new("GET", "/users/:id");
//! let span = metric.start_span("sql");
//! // ...
//! span.finish();
//! metric.status_code = 200;
//! metric.finish();
//! notifier.notify_route(&metric)?;
//!
//! notifier.close().await;
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod backlog;
pub mod collector;
pub mod config;
pub mod digest;
pub mod errors;
pub mod filter;
pub mod flusher;
pub mod http;
pub mod logger;
pub mod notifier;
pub mod queries;
pub mod queues;
pub mod routes;
pub mod stats;
pub mod trace;

pub use config::Config;
pub use errors::{ConfigError, IncompleteTimingError, NotifyError, SendError};
pub use notifier::Notifier;
pub use queries::QueryInfo;
pub use queues::QueueMetric;
pub use routes::RouteMetric;
pub use trace::{Breakdown, Span, Trace};
