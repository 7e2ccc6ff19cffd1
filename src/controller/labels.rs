//! Role labels on member pods
//!
//! The label set is computed by a pure merge; writing it back is the only
//! side effect. Writes carry the pod's resourceVersion, so a concurrent
//! change surfaces as a conflict and the fetch-merge-write is retried.

use super::cluster::{ClusterApi, ClusterError};
use super::topology::{Member, ROLE_LABEL_KEY};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Attempts of the fetch-merge-write sequence before giving up on conflicts
pub const MAX_LABEL_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Member '{pod}' has no resolved role")]
    UnresolvedRole { pod: String },

    #[error("Pod '{pod}' not found")]
    PodNotFound { pod: String },

    #[error("Error getting '{pod}' pod: {source}")]
    Lookup {
        pod: String,
        #[source]
        source: ClusterError,
    },

    #[error("Error updating '{pod}' pod labels: conflict persisted after {attempts} attempts")]
    Conflict { pod: String, attempts: u32 },

    #[error("Error updating '{pod}' pod labels: {source}")]
    Write {
        pod: String,
        #[source]
        source: ClusterError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOutcome {
    /// Labels written
    Updated,
    /// Pod already carried the right role label
    Unchanged,
}

/// Compute the label set for a pod with the given role
///
/// All existing labels are kept; only `ROLE_LABEL_KEY` is (re)set.
pub fn merge_role_label(
    existing: Option<&BTreeMap<String, String>>,
    role_value: &str,
) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = existing
        .into_iter()
        .flatten()
        .filter(|(key, _)| key.as_str() != ROLE_LABEL_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    labels.insert(ROLE_LABEL_KEY.to_string(), role_value.to_string());
    labels
}

/// Converge the role label of one member's pod
///
/// # Errors
/// * `PodNotFound` / `Lookup` - the pod could not be read
/// * `Conflict` - every attempt lost a race with another writer
/// * `Write` - any other update failure
pub async fn reconcile_member_labels(
    cluster: &dyn ClusterApi,
    namespace: &str,
    member: &Member,
) -> Result<LabelOutcome, PatchError> {
    let role_value = role_value(member)?;

    for attempt in 1..=MAX_LABEL_ATTEMPTS {
        let mut pod = cluster
            .get_pod(namespace, &member.identity)
            .await
            .map_err(|source| match source {
                ClusterError::NotFound { .. } => PatchError::PodNotFound {
                    pod: member.identity.clone(),
                },
                source => PatchError::Lookup {
                    pod: member.identity.clone(),
                    source,
                },
            })?;

        let desired = merge_role_label(pod.metadata.labels.as_ref(), role_value);
        if pod.metadata.labels.as_ref() == Some(&desired) {
            debug!(pod = %member.identity, role = role_value, "Pod labels already up to date");
            return Ok(LabelOutcome::Unchanged);
        }

        pod.metadata.labels = Some(desired);
        match cluster.replace_pod(namespace, &pod).await {
            Ok(_) => {
                info!(pod = %member.identity, role = role_value, "Updated pod role label");
                return Ok(LabelOutcome::Updated);
            }
            Err(ClusterError::Conflict { .. }) if attempt < MAX_LABEL_ATTEMPTS => {
                debug!(
                    pod = %member.identity,
                    attempt = attempt,
                    "Conflict updating pod labels, retrying with a fresh read"
                );
            }
            Err(ClusterError::Conflict { .. }) => {
                return Err(PatchError::Conflict {
                    pod: member.identity.clone(),
                    attempts: attempt,
                });
            }
            Err(source) => {
                return Err(PatchError::Write {
                    pod: member.identity.clone(),
                    source,
                });
            }
        }
    }

    Err(PatchError::Conflict {
        pod: member.identity.clone(),
        attempts: MAX_LABEL_ATTEMPTS,
    })
}

fn role_value(member: &Member) -> Result<&'static str, PatchError> {
    member.role.label_value().ok_or_else(|| PatchError::UnresolvedRole {
        pod: member.identity.clone(),
    })
}
