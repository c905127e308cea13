//! Background processing
//!
//! - [`WorkerPool`] claims ready steps and executes them with bounded
//!   concurrency
//! - [`Sweeper`] releases due timers, fires cron schedules, reclaims steps
//!   of crashed workers and purges expired run history
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     WorkerPool                        │
//! │  ┌─────────────┐      ┌───────────────────────────┐  │
//! │  │ StepPoller  │ ───▶ │ StepExecutor (Semaphore)  │  │
//! │  │  (backoff)  │      │ [step] [step] ... [step]  │  │
//! │  └─────────────┘      └───────────────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//! ┌──────────────────────────────────────────────────────┐
//! │ Sweeper: timers │ cron fires │ stale steps │ purge   │
//! └──────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;
mod sweeper;

pub use poller::{PollerConfig, PollerError, StepPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig};
