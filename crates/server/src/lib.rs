// Flowline server library
//
// HTTP intake and administration for the workflow engine. The binary in
// main.rs wires these pieces to a store, the worker pool and the sweeper.

pub mod api;
pub mod config;
pub mod openapi;
pub mod telemetry;

pub use api::{router, AppState};
pub use config::ServerConfig;
