//! pg-selector: labels the replication role of Postgres HA pods
//!
//! On every tick the watcher finds the pods behind the Service named in the
//! connection string, asks each one whether it is in recovery, and labels
//! them `pg-selector/replication-role=primary|standby`. Optionally it keeps
//! `<service>-primary` and `<service>-standby` Services selecting on that label.

pub mod config;
pub mod controller;
pub mod server;
