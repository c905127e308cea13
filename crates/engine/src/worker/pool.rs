//! Worker pool for step execution
//!
//! Manages concurrent step execution with bounded concurrency and graceful
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::poller::{PollerConfig, PollerError, StepPoller};
use crate::engine::{Engine, StepExecutor};
use crate::persistence::{StoreError, WorkflowStore};
use crate::reliability::duration_millis;
use crate::timer::Clock;

/// Worker pool configuration
///
/// The worker id comes from the engine's executor config, so claims made
/// by the pool and by [`Engine::run_until_idle`] carry the same identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum steps executing at once
    pub max_concurrency: usize,

    pub poller: PollerConfig,

    /// How long shutdown waits for executing steps
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrency (at least 1)
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Running and claiming steps
    Running,
    /// Finishing executing steps, not claiming new ones
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Pool of workers executing steps claimed from the store
///
/// # Example
///
/// ```ignore
/// use flowline_engine::worker::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(&engine, WorkerPoolConfig::new().with_max_concurrency(20));
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
    executor: Arc<StepExecutor>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    permits: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(engine: &Engine, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store: engine.store().clone(),
            clock: engine.clock().clone(),
            executor: engine.executor(),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            poll_handle: Mutex::new(None),
        }
    }

    /// Start polling in the background
    #[instrument(skip(self), fields(worker_id = %self.worker_id()))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.worker_id(),
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );
        self.start_poll_loop();
        Ok(())
    }

    /// Stop claiming and wait for executing steps to finish
    #[instrument(skip(self), fields(worker_id = %self.worker_id()))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!("poll loop panicked: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.permits.available_permits();
            if available == self.config.max_concurrency {
                debug!("all steps finished");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                // Unfinished steps stay executing until the sweeper reclaims them
                warn!(
                    remaining = self.config.max_concurrency - available,
                    "shutdown timeout reached"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Steps currently executing
    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    pub fn worker_id(&self) -> &str {
        self.executor.worker_id()
    }

    fn start_poll_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let permits = Arc::clone(&self.permits);
        let mut poller = StepPoller::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.worker_id().to_string(),
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );

        let handle = tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let available = permits.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(steps) => {
                        let found = !steps.is_empty();
                        for step in steps {
                            // Only this loop acquires permits, so one is free
                            // for every claimed step
                            let permit = match Arc::clone(&permits).acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let executor = Arc::clone(&executor);
                            tokio::spawn(async move {
                                let step_id = step.id;
                                match executor.execute_claimed(step).await {
                                    Ok(outcome) => debug!(%step_id, ?outcome, "step finished"),
                                    Err(e) => error!(%step_id, "step execution failed: {}", e),
                                }
                                drop(permit);
                            });
                        }
                        // Keep draining while the queue has work
                        if found {
                            continue;
                        }
                    }
                    Err(e) => error!("poll error: {}", e),
                }

                if poller.wait().await {
                    break;
                }
            }
            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}
