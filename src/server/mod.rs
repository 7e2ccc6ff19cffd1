//! Process plumbing around the watcher
//!
//! - `/healthz` and `/readyz` probes for the kubelet
//! - Graceful shutdown on SIGTERM/SIGINT

mod health;
pub mod shutdown;

pub use health::{run_health_server, ReadinessState};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
