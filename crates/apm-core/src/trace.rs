// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span timing for one unit of work.
//!
//! A [`Trace`] owns a table of open spans and a pointer to the active one.
//! Starting a span pauses the active span and makes the new one active;
//! finishing the active span resumes its parent. Exactly one span is running
//! at any time, so the resulting [`Breakdown`] partitions the trace's wall
//! time between span names even when several tasks share the trace.
//!
//! ```text
//!   request.handler ──┐ paused ┌── running ──┐ paused ┌── running
//!                     └ sql ───┘             └ http ──┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::IncompleteTimingError;

/// Span name to total time spent in spans of that name.
pub type Breakdown = HashMap<String, Duration>;

type SpanId = u64;

#[derive(Debug)]
struct SpanState {
    name: String,
    parent: Option<SpanId>,
    elapsed: Duration,
    /// Set while the span is running.
    running_since: Option<Instant>,
    /// Reentrancy depth, the span ends when it drops to zero.
    level: u32,
}

impl SpanState {
    fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.elapsed += now.saturating_duration_since(since);
        }
    }

    fn resume(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }
}

#[derive(Debug)]
struct TraceState {
    end: Option<Instant>,
    spans: HashMap<SpanId, SpanState>,
    active: Option<SpanId>,
    breakdown: Breakdown,
    next_id: SpanId,
}

impl TraceState {
    fn open(&mut self, name: &str, now: Instant) -> SpanId {
        if let Some(active) = self.active {
            if let Some(span) = self.spans.get_mut(&active) {
                if span.name == name {
                    span.level += 1;
                    return active;
                }
                span.pause(now);
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.spans.insert(
            id,
            SpanState {
                name: name.to_string(),
                parent: self.active,
                elapsed: Duration::ZERO,
                running_since: Some(now),
                level: 1,
            },
        );
        self.active = Some(id);
        id
    }

    /// Returns false when the span is no longer open.
    fn close(&mut self, id: SpanId, now: Instant) -> bool {
        let Some(span) = self.spans.get_mut(&id) else {
            return false;
        };
        if span.level > 1 {
            span.level -= 1;
            return true;
        }

        let Some(mut span) = self.spans.remove(&id) else {
            return false;
        };
        span.pause(now);

        for child in self.spans.values_mut() {
            if child.parent == Some(id) {
                child.parent = span.parent;
            }
        }

        if self.active == Some(id) {
            self.active = span.parent;
            if let Some(parent) = span.parent.and_then(|p| self.spans.get_mut(&p)) {
                parent.resume(now);
            }
        }

        if self.end.is_some() {
            debug!("APM | span {} finished after its trace, not recorded", span.name);
            return true;
        }
        *self.breakdown.entry(span.name).or_default() += span.elapsed;
        true
    }
}

#[derive(Debug)]
struct TraceInner {
    start_time: SystemTime,
    start: Instant,
    root: SpanId,
    state: Mutex<TraceState>,
}

/// Root timing context for one request or job. Cheap to clone; clones share
/// the same span table.
#[derive(Debug, Clone)]
pub struct Trace {
    inner: Arc<TraceInner>,
}

impl Trace {
    /// Opens a trace whose root span, named `root_span`, starts running now.
    #[must_use]
    pub fn new(root_span: &str) -> Self {
        let start_time = SystemTime::now();
        let start = Instant::now();
        let mut state = TraceState {
            end: None,
            spans: HashMap::new(),
            active: None,
            breakdown: Breakdown::new(),
            next_id: 0,
        };
        let root = state.open(root_span, start);
        Trace {
            inner: Arc::new(TraceInner {
                start_time,
                start,
                root,
                state: Mutex::new(state),
            }),
        }
    }

    /// Wall-clock time the trace started, used for bucketing.
    #[must_use]
    pub fn start_time(&self) -> SystemTime {
        self.inner.start_time
    }

    /// Starts a span named `name` under the active span.
    #[must_use]
    pub fn start_span(&self, name: &str) -> Span {
        let id = self.inner.state.lock().open(name, Instant::now());
        Span {
            trace: Arc::downgrade(&self.inner),
            id,
            name: name.to_string(),
            finished: AtomicBool::new(false),
        }
    }

    /// Finishes the root span, fixes the end time and returns the breakdown.
    /// Spans still open at this point are not recorded.
    pub fn finish(&self) -> Breakdown {
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        if state.end.is_some() {
            warn!("APM | trace already finished");
            return state.breakdown.clone();
        }

        // drop every reentrant level of the root span at once
        if let Some(root) = state.spans.get_mut(&self.inner.root) {
            root.level = 1;
        }
        state.close(self.inner.root, now);
        if !state.spans.is_empty() {
            debug!(
                "APM | trace finished with {} open span(s), their time is not recorded",
                state.spans.len()
            );
        }
        state.end = Some(now);
        state.breakdown.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().end.is_some()
    }

    /// Snapshot of the breakdown recorded so far.
    #[must_use]
    pub fn breakdown(&self) -> Breakdown {
        self.inner.state.lock().breakdown.clone()
    }

    /// Total elapsed time between start and finish.
    pub fn duration(&self) -> Result<Duration, IncompleteTimingError> {
        let end = self
            .inner
            .state
            .lock()
            .end
            .ok_or(IncompleteTimingError::MissingEnd)?;
        Ok(end.saturating_duration_since(self.inner.start))
    }
}

/// Handle to one named interval of a [`Trace`]. It only holds a weak
/// reference, so it never keeps a trace alive.
#[derive(Debug)]
pub struct Span {
    trace: Weak<TraceInner>,
    id: SpanId,
    name: String,
    finished: AtomicBool,
}

impl Span {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the span's clock. No-op when already paused.
    pub fn pause(&self) {
        self.with_state(|span, now| span.pause(now));
    }

    /// Restarts the span's clock. No-op when already running.
    pub fn resume(&self) {
        self.with_state(|span, now| span.resume(now));
    }

    /// Records the span into its trace's breakdown. A second call logs a
    /// warning and changes nothing.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            warn!("APM | span {} already finished", self.name);
            return;
        }

        let Some(trace) = self.trace.upgrade() else {
            debug!("APM | span {} outlived its trace", self.name);
            return;
        };
        let closed = trace.state.lock().close(self.id, Instant::now());
        if !closed {
            warn!("APM | span {} is no longer open", self.name);
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut SpanState, Instant)) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let Some(trace) = self.trace.upgrade() else {
            return;
        };
        let mut state = trace.state.lock();
        if let Some(span) = state.spans.get_mut(&self.id) {
            f(span, Instant::now());
        }
    }
}
