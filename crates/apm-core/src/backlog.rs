// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded retry queues for payloads that failed with a transient error.
//!
//! Each payload class gets its own queue of at most `max_size` entries. A
//! background loop drains every queue on a fixed period and resends each
//! entry exactly once; an entry that fails again is discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::collector::{Collector, Payload, PayloadClass};

#[derive(Debug)]
pub struct Backlog {
    queues: Mutex<HashMap<PayloadClass, VecDeque<Payload>>>,
    max_size: usize,
    disabled: HashSet<PayloadClass>,
}

impl Backlog {
    #[must_use]
    pub fn new(max_size: usize, disabled: HashSet<PayloadClass>) -> Self {
        Backlog {
            queues: Mutex::new(HashMap::new()),
            max_size,
            disabled,
        }
    }

    #[must_use]
    pub fn is_disabled(&self, class: PayloadClass) -> bool {
        self.disabled.contains(&class)
    }

    /// Queues `payload` for a later retry. Returns whether it was kept.
    pub fn push(&self, payload: Payload) -> bool {
        let class = payload.class;
        if self.is_disabled(class) {
            warn!("APM | backlog is disabled for {class}, dropping payload");
            return false;
        }

        let mut queues = self.queues.lock();
        let queue = queues.entry(class).or_default();
        if queue.len() >= self.max_size {
            warn!(
                "APM | {class} backlog is full ({} entries), dropping payload",
                self.max_size
            );
            return false;
        }
        queue.push_back(payload);
        debug!("APM | {class} payload added to the backlog ({} queued)", queue.len());
        true
    }

    #[must_use]
    pub fn len(&self, class: PayloadClass) -> usize {
        self.queues.lock().get(&class).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.lock().values().all(VecDeque::is_empty)
    }

    /// Takes every queued payload, oldest first within each class.
    pub fn drain(&self) -> Vec<Payload> {
        let mut queues = self.queues.lock();
        PayloadClass::ALL
            .iter()
            .filter_map(|class| queues.remove(class))
            .flatten()
            .collect()
    }

    /// Resends every queued payload once.
    pub async fn flush(&self, collector: &Collector) {
        let payloads = self.drain();
        if payloads.is_empty() {
            return;
        }
        debug!("APM | resending {} backlogged payload(s)", payloads.len());
        for payload in payloads {
            match collector.send(&payload).await {
                Ok(()) => debug!("APM | backlogged {} payload sent", payload.class),
                Err(e) => error!(
                    "APM | failed to resend backlogged {} payload, discarding it: {e}",
                    payload.class
                ),
            }
        }
    }

    /// Flushes on every `period` until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        collector: Arc<Collector>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("APM | backlog loop stopped");
                    return;
                }
                _ = ticker.tick() => self.flush(&collector).await,
            }
        }
    }
}
