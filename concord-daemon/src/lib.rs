//! Reconciliation host: turns store change notifications into debounced,
//! bounded-concurrency reconcile passes.

pub mod config;
mod error;
pub mod paths;
mod runtime;

pub use config::HostConfig;
pub use error::DaemonError;
pub use runtime::{init_tracing, run, start_blocking, Host};
