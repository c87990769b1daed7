// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for producers: owns the aggregators, the collector client,
//! the backlog and the two background loops.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backlog::Backlog;
use crate::collector::{Collector, PayloadClass};
use crate::config::Config;
use crate::errors::{ConfigError, NotifyError};
use crate::flusher::Flusher;
use crate::logger;
use crate::queries::{QueryInfo, QueryStats};
use crate::queues::{QueueMetric, QueueStats};
use crate::routes::{RouteBreakdowns, RouteMetric, RouteStats};

struct Pipeline {
    route_stats: RouteStats,
    route_breakdowns: RouteBreakdowns,
    query_stats: QueryStats,
    queue_stats: QueueStats,
    flusher: Flusher,
}

impl Pipeline {
    /// Rotates every aggregator, then sends the rotated buckets. Rotation
    /// happens before the first await so the caller's tick boundary is exact.
    fn flush(self: &Arc<Self>) -> impl std::future::Future<Output = ()> + Send + 'static {
        let routes = self.route_stats.rotate();
        let breakdowns = self.route_breakdowns.rotate();
        let queries = self.query_stats.rotate();
        let queues = self.queue_stats.rotate();
        let pipeline = Arc::clone(self);

        async move {
            let flusher = &pipeline.flusher;
            // Failures are logged and backlogged by the flusher
            let _ = tokio::join!(
                flusher.flush_snapshot(PayloadClass::RouteStats, routes),
                flusher.flush_snapshot(PayloadClass::RouteBreakdowns, breakdowns),
                flusher.flush_snapshot(PayloadClass::QueryStats, queries),
                flusher.flush_snapshot(PayloadClass::QueueStats, queues),
            );
        }
    }
}

pub struct Notifier {
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    collector: Arc<Collector>,
    backlog: Arc<Backlog>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Notifier {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let collector = Arc::new(Collector::new(&config)?);
        let backlog = Arc::new(Backlog::new(
            config.backlog_max_size,
            config.backlog_disabled.clone(),
        ));
        let flusher = Flusher::new(
            Arc::clone(&collector),
            Arc::clone(&backlog),
            config.environment.clone(),
        );

        Ok(Notifier {
            config: Arc::new(config),
            pipeline: Arc::new(Pipeline {
                route_stats: RouteStats::default(),
                route_breakdowns: RouteBreakdowns::default(),
                query_stats: QueryStats::default(),
                queue_stats: QueueStats::default(),
                flusher,
            }),
            collector,
            backlog,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Notifier::new(Config::from_env()?)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// Installs the crate's log formatter at the configured level. Hosts with
    /// their own subscriber skip this.
    pub fn init_logging(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        logger::init(&self.config.log_level)
    }

    fn accepting(&self, class: PayloadClass) -> Result<(), NotifyError> {
        if self.config.disabled {
            return Err(NotifyError::Disabled(class));
        }
        if self.cancel.is_cancelled() {
            return Err(NotifyError::Closed(class));
        }
        Ok(())
    }

    /// Records a finished route into route stats and route breakdowns.
    pub fn notify_route(&self, metric: &RouteMetric) -> Result<(), NotifyError> {
        self.accepting(PayloadClass::RouteStats)?;
        if self.config.route_blocklist.is_blocked(&metric.route) {
            debug!("APM | route {} is blocklisted", metric.route);
            return Ok(());
        }
        self.pipeline.route_stats.notify(metric)?;
        self.pipeline.route_breakdowns.notify(metric)?;
        Ok(())
    }

    pub fn notify_query(&self, info: &QueryInfo) -> Result<(), NotifyError> {
        self.accepting(PayloadClass::QueryStats)?;
        if self.config.route_blocklist.is_blocked(&info.route) {
            debug!("APM | query on route {} is blocklisted", info.route);
            return Ok(());
        }
        self.pipeline.query_stats.notify(info)?;
        Ok(())
    }

    pub fn notify_queue(&self, metric: &QueueMetric) -> Result<(), NotifyError> {
        self.accepting(PayloadClass::QueueStats)?;
        if self.config.queue_blocklist.is_blocked(&metric.queue) {
            debug!("APM | queue {} is blocklisted", metric.queue);
            return Ok(());
        }
        self.pipeline.queue_stats.notify(metric)?;
        Ok(())
    }

    /// Spawns the flush and backlog loops on the current runtime. Later calls
    /// are no-ops.
    pub fn start(&self) {
        if self.config.disabled {
            info!("APM | disabled, background flushing not started");
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            error!("APM | no tokio runtime, background flushing not started");
            return;
        };

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let period = self.config.flush_interval;
        let cancel = self.cancel.clone();
        tasks.push(runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // discard first tick, which is instantaneous
            // Sends keep running while the ticker moves on
            let mut sending = JoinSet::new();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        while let Some(result) = sending.join_next().await {
                            log_join_error(result);
                        }
                        debug!("APM | flush loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        sending.spawn(pipeline.flush());
                    }
                    Some(result) = sending.join_next(), if !sending.is_empty() => {
                        log_join_error(result);
                    }
                }
            }
        }));

        tasks.push(runtime.spawn(Arc::clone(&self.backlog).run(
            Arc::clone(&self.collector),
            self.config.backlog_flush_interval,
            self.cancel.clone(),
        )));
        debug!(
            "APM | started, flushing every {:?}, backlog every {:?}",
            self.config.flush_interval, self.config.backlog_flush_interval
        );
    }

    /// Rotates every aggregator and sends the buckets, waiting for the sends.
    pub async fn flush(&self) {
        self.pipeline.flush().await;
    }

    /// Resends the backlog now.
    pub async fn flush_backlog(&self) {
        self.backlog.flush(&self.collector).await;
    }

    /// Stops the background loops, waits for sends already under way and
    /// sends what is left. Later `notify_*` calls are refused.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("APM | background task failed: {e}");
            }
        }
        self.flush().await;
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!("APM | flush task failed: {e}");
    }
}
