//! Startup configuration for the pg-selector controller
//!
//! Everything the controller needs is resolved here, once, into a [`Config`]:
//! - CLI flags (`pg-selector run ...`)
//! - The Postgres connection string (flag or `PG_CONNECTION_STRING`)
//! - The member-set target derived from the connection host
//!
//! No other module reads the process environment.

use clap::{Args, Parser, Subcommand, ValueEnum};
use regex::{Captures, Regex};
use sqlx::postgres::PgConnectOptions;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Name used for the managed-by marker, the log span and the CLI
pub const APP_NAME: &str = "pg-selector";

/// Standard Postgres port, used when the connection string names none
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Host shape required for the connection string: `name.namespace.svc[.suffix...]`
static SERVICE_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9_-]+)\.([a-z0-9_-]+)\.svc(\.[a-z0-9_-]+)*$")
        .expect("service host pattern is valid")
});

/// Host and optional port of a `postgres[ql]://` URL
static URL_AUTHORITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^postgres(?:ql)?://(?:[^/?#]*@)?(\[[^\]]*\]|[^:/?#]*)(?::([0-9]*))?")
        .expect("url authority pattern is valid")
});

/// `$VAR` and `${VAR}` references inside the connection string
static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("env reference pattern is valid")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(#[from] sqlx::Error),

    #[error("Connection host '{0}' does not have the form name.namespace.svc[.cluster-domain]")]
    InvalidServiceHost(String),

    #[error("Invalid port '{0}' in connection string")]
    InvalidPort(String),

    #[error("Invalid duration for {flag}: {value}")]
    InvalidDuration { flag: &'static str, value: String },
}

#[derive(Debug, Parser)]
#[command(name = APP_NAME)]
#[command(about = "Labels the replication role of Postgres HA pods in Kubernetes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the replication-role label synchronizer
    Run(RunArgs),
    /// Print the version
    Version,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Postgres connection string; the host must be a Service DNS name
    #[arg(long, env = "PG_CONNECTION_STRING", hide_env_values = true)]
    pub connection_string: String,

    /// Time between synchronizations (e.g. 500ms, 5s, 1m30s)
    #[arg(long, default_value = "5s")]
    pub sync_time: String,

    /// Create and update the -primary and -standby Services
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub services_creation: bool,

    /// Upper bound for connecting to and querying a single member (e.g. 2s, 1500ms)
    #[arg(long, default_value = "5s")]
    pub probe_timeout: String,

    /// Verbosity level for logs
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Port for the /healthz and /readyz endpoints
    #[arg(long, default_value_t = 8080)]
    pub health_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Default directive for the tracing `EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// The member set this controller manages
///
/// Derived from the connection string host `name.namespace.svc...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSetTarget {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

/// Fully resolved controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub target: MemberSetTarget,
    /// Base options for member probes (credentials, database, sslmode)
    pub connect_options: PgConnectOptions,
    pub sync_interval: Duration,
    pub probe_timeout: Duration,
    pub services_creation: bool,
    pub health_port: u16,
}

impl Config {
    /// Resolve CLI arguments into a `Config`
    ///
    /// `lookup` is used to expand `$VAR` references in the connection string.
    pub fn from_args(
        args: &RunArgs,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let connection_string = expand_env(&args.connection_string, lookup);
        let (target, connect_options) = resolve_target(&connection_string)?;

        let sync_interval =
            parse_duration(&args.sync_time).ok_or_else(|| ConfigError::InvalidDuration {
                flag: "sync-time",
                value: args.sync_time.clone(),
            })?;
        let probe_timeout =
            parse_duration(&args.probe_timeout).ok_or_else(|| ConfigError::InvalidDuration {
                flag: "probe-timeout",
                value: args.probe_timeout.clone(),
            })?;

        Ok(Config {
            target,
            connect_options,
            sync_interval,
            probe_timeout,
            services_creation: args.services_creation,
            health_port: args.health_port,
        })
    }
}

/// Resolve a connection string into the member-set target and probe options
///
/// The host must be a Service DNS name (`pg-set.db.svc` or
/// `pg-set.db.svc.cluster.local`); the Service name and namespace are taken
/// from its first two labels. Host and port come from the URL alone, never
/// from `PGHOST`/`PGPORT`; the port defaults to 5432.
///
/// # Errors
/// `ConfigError` if the URL cannot be parsed or the host has the wrong shape.
/// These are fatal: a bad connection string cannot fix itself.
pub fn resolve_target(
    connection_string: &str,
) -> Result<(MemberSetTarget, PgConnectOptions), ConfigError> {
    let options = PgConnectOptions::from_str(connection_string)?;

    let authority = URL_AUTHORITY.captures(connection_string);
    let host = authority
        .as_ref()
        .and_then(|caps| caps.get(1))
        .map_or("", |m| m.as_str());
    let port = match authority.as_ref().and_then(|caps| caps.get(2)) {
        Some(port) if !port.as_str().is_empty() => port
            .as_str()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(port.as_str().to_string()))?,
        _ => DEFAULT_PG_PORT,
    };

    let captures = SERVICE_HOST
        .captures(host)
        .ok_or_else(|| ConfigError::InvalidServiceHost(host.to_string()))?;

    let target = MemberSetTarget {
        name: captures[1].to_string(),
        namespace: captures[2].to_string(),
        port,
    };

    Ok((target, options.host(host).port(port)))
}

/// Expand `$VAR` and `${VAR}` references; unset variables become empty
pub fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_REFERENCE
        .replace_all(input, |caps: &Captures| {
            let key = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(key).unwrap_or_default()
        })
        .into_owned()
}

/// Parse duration string (e.g., "500ms", "5s", "1m30s", "2h")
///
/// A duration is one or more `<number><unit>` segments with units `ms`,
/// `s`, `m` and `h`. Zero, negative, fractional and unit-less values are
/// rejected.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let mut rest = duration_str.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let unit_start = rest.find(|c: char| !c.is_ascii_digit())?;
        let (number_str, tail) = rest.split_at(unit_start);
        let number: u64 = number_str.parse().ok()?;

        let unit_end = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let segment = match unit {
            "ms" => Duration::from_millis(number),
            "s" => Duration::from_secs(number),
            "m" => Duration::from_secs(number.checked_mul(60)?),
            "h" => Duration::from_secs(number.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(segment)?;
        rest = next;
    }

    (!total.is_zero()).then_some(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "config_test.rs"]
mod tests;
