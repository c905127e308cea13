//! Behavior abstractions
//!
//! Behaviors are the side effects action nodes invoke. They:
//! - Receive rendered params and the step's context view
//! - May fail and be retried according to the node's retry policy
//! - Are looked up by name in the `BehaviorRegistry`

mod builtin;
mod context;
mod definition;
mod registry;

pub use builtin::{register_builtins, LogBehavior, UpsertRecordBehavior};
pub use context::BehaviorContext;
pub use definition::{Behavior, BehaviorError};
pub use registry::BehaviorRegistry;
