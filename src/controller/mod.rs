pub mod cluster;
pub mod discovery;
pub mod labels;
pub mod probe;
pub mod services;
pub mod topology;
pub mod watcher;

pub use watcher::{run, run_cycle, Context, CycleError, CycleReport};
