//! The reconciliation loop
//!
//! Every tick runs one full cycle:
//! 1. Discover members from the member-set EndpointSlices
//! 2. Probe each member's replication role
//! 3. Check there is exactly one primary
//! 4. Converge the role label on every member pod
//! 5. Publish the `-primary` / `-standby` Services (optional)
//!
//! Steps 1-3 abort the cycle on error. Steps 4 and 5 isolate failures per
//! pod / per Service. Nothing is carried from one cycle to the next.

use super::cluster::{ClusterApi, KubeCluster};
use super::discovery::{discover, DiscoveryError};
use super::labels::{reconcile_member_labels, LabelOutcome};
use super::probe::{PostgresProber, ProbeError, RoleProber};
use super::services::{publish_role_services, UpsertOutcome};
use super::topology::{check, InvariantViolation};
use crate::config::{Config, MemberSetTarget, APP_NAME};
use crate::server::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Errors that end a cycle early
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Unable to get pg pods info: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Unable to set pg pods types: {0}")]
    Probe(#[from] ProbeError),

    #[error("Inconsistent replication topology: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// Summary of a completed cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub members: usize,
    pub labels_updated: usize,
    pub labels_unchanged: usize,
    pub label_failures: usize,
    pub services_created: usize,
    pub services_updated: usize,
    pub service_failures: usize,
    /// False when publishing is disabled
    pub services_published: bool,
}

/// Everything a cycle needs, resolved once at startup
pub struct Context {
    pub cluster: Arc<dyn ClusterApi>,
    pub prober: Arc<dyn RoleProber>,
    pub target: MemberSetTarget,
    pub sync_interval: Duration,
    pub services_creation: bool,
}

impl Context {
    /// Production context: kube-rs client and Postgres prober
    pub fn new(client: kube::Client, config: &Config) -> Self {
        Context {
            cluster: Arc::new(KubeCluster::new(client)),
            prober: Arc::new(PostgresProber::new(
                config.connect_options.clone(),
                config.target.port,
                config.probe_timeout,
            )),
            target: config.target.clone(),
            sync_interval: config.sync_interval,
            services_creation: config.services_creation,
        }
    }

    #[cfg(test)]
    pub fn new_mock(
        cluster: Arc<dyn ClusterApi>,
        prober: Arc<dyn RoleProber>,
        services_creation: bool,
    ) -> Self {
        Context {
            cluster,
            prober,
            target: MemberSetTarget {
                namespace: "ns".to_string(),
                name: "pg-set".to_string(),
                port: 5432,
            },
            sync_interval: Duration::from_millis(10),
            services_creation,
        }
    }
}

/// Run one reconciliation cycle
///
/// # Returns
/// * `Ok(CycleReport)` - the topology was valid; labels and Services were
///   converged as far as individual writes allowed
/// * `Err(CycleError)` - discovery, probing or the topology check failed;
///   nothing was written
pub async fn run_cycle(ctx: &Context) -> Result<CycleReport, CycleError> {
    let namespace = ctx.target.namespace.as_str();
    let name = ctx.target.name.as_str();

    let mut snapshot = discover(ctx.cluster.as_ref(), namespace, name).await?;
    debug!(
        members = snapshot.members.len(),
        endpoint_slices = ?snapshot.endpoint_slices,
        "Success getting pg pods info"
    );

    for member in snapshot.members.iter_mut() {
        member.role = ctx.prober.probe(member).await?;
    }
    debug!(
        pg_pods_info = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "Success setting pg pods types"
    );

    let counts = check(&snapshot)?;
    debug!(primary = counts.primary, standby = counts.standby, "Topology check passed");

    let mut report = CycleReport {
        members: snapshot.members.len(),
        ..Default::default()
    };

    for member in &snapshot.members {
        match reconcile_member_labels(ctx.cluster.as_ref(), namespace, member).await {
            Ok(LabelOutcome::Updated) => report.labels_updated += 1,
            Ok(LabelOutcome::Unchanged) => report.labels_unchanged += 1,
            Err(e) => {
                warn!(pod = %member.identity, error = %e, "Unable to update pg pod labels");
                report.label_failures += 1;
            }
        }
    }

    if ctx.services_creation {
        report.services_published = true;
        match publish_role_services(ctx.cluster.as_ref(), namespace, name).await {
            Ok(publish) => {
                for (_, outcome) in &publish.upserted {
                    match outcome {
                        UpsertOutcome::Created => report.services_created += 1,
                        UpsertOutcome::Updated => report.services_updated += 1,
                    }
                }
                report.service_failures = publish.failures.len();
            }
            Err(e) => {
                warn!(error = %e, "Unable to create pg pods services");
                report.service_failures += 1;
            }
        }
    }

    Ok(report)
}

/// Drive cycles until shutdown
///
/// Waits `sync_interval` before each cycle. The wait races the shutdown
/// signal; a cycle that has started always runs to completion.
pub async fn run(ctx: Arc<Context>, mut shutdown: ShutdownSignal) {
    let span = info_span!(
        "watcher",
        service = APP_NAME,
        component = "watcher",
        namespace = %ctx.target.namespace,
        member_set = %ctx.target.name,
    );

    async move {
        info!(interval = ?ctx.sync_interval, services_creation = ctx.services_creation, "Watcher started");

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            debug!("Wait to next sync");
            if shutdown.sleep(ctx.sync_interval).await {
                break;
            }

            match run_cycle(&ctx).await {
                Ok(report) => info!(
                    members = report.members,
                    labels_updated = report.labels_updated,
                    labels_unchanged = report.labels_unchanged,
                    label_failures = report.label_failures,
                    services_created = report.services_created,
                    services_updated = report.services_updated,
                    service_failures = report.service_failures,
                    "Success in flow execution"
                ),
                Err(e) => error!(error = %e, "Reconciliation cycle aborted"),
            }
        }

        info!("Execution cancelled, watcher stopped");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "watcher_test.rs"]
mod tests;
