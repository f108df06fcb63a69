pub mod client;
pub mod config;
pub mod control;
pub mod daemon;
pub mod digest;
pub mod events;
pub mod filters;
pub mod http;
pub mod logging;
pub mod mutator;
pub mod reconcile;
pub mod snapshot;
pub mod state;
pub mod sync;
pub mod telemetry;
pub mod workspace;
