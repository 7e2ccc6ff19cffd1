//! Member discovery from EndpointSlices
//!
//! The member set is the Service named in the connection string. Its
//! EndpointSlices (owned by that Service) list one endpoint per pod.

use super::cluster::{ClusterApi, ClusterError};
use super::topology::{Member, MemberSnapshot};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to list EndpointSlices in namespace '{namespace}': {source}")]
    List {
        namespace: String,
        #[source]
        source: ClusterError,
    },

    #[error("EndpointSlice in '{namespace}' namespace with '{name}' owner reference not found")]
    MemberSetNotFound { namespace: String, name: String },

    #[error("EndpointSlices in '{namespace}' namespace owned by '{name}' have no routable members")]
    NoRoutableMembers { namespace: String, name: String },
}

/// Whether a slice is owned by the Service `service_name`
pub fn is_owned_by_service(slice: &EndpointSlice, service_name: &str) -> bool {
    slice
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| {
            owners
                .iter()
                .any(|owner| owner.kind == "Service" && owner.name == service_name)
        })
}

/// Build the member list from the slices owned by one Service
///
/// Endpoints are merged by pod name across slices (dual-stack Services get
/// one slice per IP family). Endpoints without addresses or without a pod
/// reference are skipped: they cannot be probed or labeled.
pub fn members_from_slices<'a>(slices: impl IntoIterator<Item = &'a EndpointSlice>) -> Vec<Member> {
    let mut members: Vec<Member> = Vec::new();

    for slice in slices {
        let slice_name = slice.metadata.name.as_deref().unwrap_or_default();

        for endpoint in &slice.endpoints {
            let Some(identity) = endpoint
                .target_ref
                .as_ref()
                .filter(|r| r.kind.as_deref().unwrap_or("Pod") == "Pod")
                .and_then(|r| r.name.clone())
            else {
                warn!(
                    endpoint_slice = slice_name,
                    addresses = ?endpoint.addresses,
                    "Skipping endpoint without a pod reference"
                );
                continue;
            };

            if endpoint.addresses.is_empty() {
                debug!(
                    endpoint_slice = slice_name,
                    pod = %identity,
                    "Skipping endpoint without addresses"
                );
                continue;
            }

            match members.iter_mut().find(|m| m.identity == identity) {
                Some(existing) => {
                    for address in &endpoint.addresses {
                        if !existing.addresses.contains(address) {
                            existing.addresses.push(address.clone());
                        }
                    }
                }
                None => members.push(Member::new(identity, endpoint.addresses.clone())),
            }
        }
    }

    members
}

/// Discover the current members of the member set
///
/// Re-reads the EndpointSlices every time; membership can change between
/// cycles without notice.
///
/// # Errors
/// * `MemberSetNotFound` - no EndpointSlice is owned by the Service
/// * `NoRoutableMembers` - the slices exist but list no addressable pod
/// * `List` - the Kubernetes API call failed
pub async fn discover(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
) -> Result<MemberSnapshot, DiscoveryError> {
    let slices = cluster
        .list_endpoint_slices(namespace)
        .await
        .map_err(|source| DiscoveryError::List {
            namespace: namespace.to_string(),
            source,
        })?;

    let owned: Vec<&EndpointSlice> = slices
        .iter()
        .filter(|slice| is_owned_by_service(slice, name))
        .collect();

    if owned.is_empty() {
        return Err(DiscoveryError::MemberSetNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    let members = members_from_slices(owned.iter().copied());
    if members.is_empty() {
        return Err(DiscoveryError::NoRoutableMembers {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }

    Ok(MemberSnapshot {
        endpoint_slices: owned
            .iter()
            .filter_map(|slice| slice.metadata.name.clone())
            .collect(),
        members,
    })
}
