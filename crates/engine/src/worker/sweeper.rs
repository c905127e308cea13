//! Periodic maintenance sweep
//!
//! Each pass releases due timers back to the ready queue, fires due cron
//! schedules, returns steps held by crashed workers to `pending`, settles
//! runs whose worker stopped before settling them, and purges the step
//! history of runs past the retention window.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{Engine, EngineError};
use crate::persistence::PurgeReport;
use crate::reliability::duration_millis;

/// Sweeper configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Time between passes
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Maximum rows handled per task per pass
    pub batch_size: usize,

    /// How long a step may stay executing before it is reclaimed
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// How long finished runs keep their step history; `None` keeps it forever
    #[serde(default, with = "optional_duration_millis")]
    pub retention: Option<Duration>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            stale_threshold: Duration::from_secs(300),
            retention: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

impl SweeperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set batch size (at least 1)
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }
}

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: usize,
    pub schedules_fired: usize,
    pub reclaimed: usize,
    /// Runs re-settled after their worker stopped mid-settlement
    pub settled: usize,
    pub purged: PurgeReport,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Runs maintenance passes on an interval
#[derive(Clone)]
pub struct Sweeper {
    engine: Engine,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(engine: Engine, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run a single pass
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        let batch = self.config.batch_size;
        let now = self.engine.timers().now();

        let released = self.engine.timers().poll_due(batch).await?.len();
        let schedules_fired = self.engine.fire_due_schedules(batch).await?.runs.len();

        let claimed_before = now - to_chrono(self.config.stale_threshold);
        let reclaimed = self
            .engine
            .store()
            .reclaim_stale_steps(claimed_before, now)
            .await?
            .len();

        let mut settled = 0;
        for run_id in self.engine.store().list_unsettled(batch).await? {
            match self.engine.settle_run(run_id).await {
                Ok(()) => settled += 1,
                Err(e) => warn!(%run_id, "settling run failed: {}", e),
            }
        }

        let purged = match self.config.retention {
            Some(retention) => {
                self.engine
                    .store()
                    .purge_finished_runs(now - to_chrono(retention), batch, now)
                    .await?
            }
            None => PurgeReport::default(),
        };

        let report = SweepReport {
            released,
            schedules_fired,
            reclaimed,
            settled,
            purged,
        };
        if report.reclaimed > 0 {
            info!(count = report.reclaimed, "reclaimed stale steps");
        }
        if !report.is_empty() {
            debug!(?report, "sweep pass");
        }
        Ok(report)
    }

    /// Sweep every `interval` until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("sweep failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("sweeper: shutdown requested");
                    break;
                }
            }
        }
        debug!("sweeper exited");
    }

    /// Run on a background task
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
