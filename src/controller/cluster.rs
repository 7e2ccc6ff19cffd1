//! Kubernetes access used by the watcher
//!
//! The watcher only needs a handful of calls, so they sit behind the
//! `ClusterApi` trait. Production uses `KubeCluster` (kube-rs); tests use
//! `MockCluster`, an in-memory store with failure injection.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams, PostParams};
use thiserror::Error;

/// Errors from the Kubernetes API, classified by how the watcher reacts
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Conflict writing {kind} '{name}': {message}")]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[error("{kind} is missing name in metadata")]
    MissingName { kind: &'static str },

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

impl ClusterError {
    /// Map a kube error for `kind/name` onto NotFound / Conflict / KubeError
    fn classify(error: kube::Error, kind: &'static str, name: &str) -> Self {
        match error {
            kube::Error::Api(ref response) if response.code == 404 => ClusterError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(ref response) if response.code == 409 => ClusterError::Conflict {
                kind,
                name: name.to_string(),
                message: response.message.clone(),
            },
            other => ClusterError::KubeError(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_endpoint_slices(&self, namespace: &str)
        -> Result<Vec<EndpointSlice>, ClusterError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;

    /// Full update; fails with `Conflict` if the resourceVersion is stale
    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError>;

    /// Full update of an existing Service; `NotFound` if it does not exist
    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;
}

/// `ClusterApi` backed by a kube-rs client
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        KubeCluster { client }
    }
}

fn object_name<'a>(name: &'a Option<String>, kind: &'static str) -> Result<&'a str, ClusterError> {
    name.as_deref().ok_or(ClusterError::MissingName { kind })
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_endpoint_slices(
        &self,
        namespace: &str,
    ) -> Result<Vec<EndpointSlice>, ClusterError> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClusterError::classify(e, "Pod", name))
    }

    async fn replace_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        let name = object_name(&pod.metadata.name, "Pod")?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), pod)
            .await
            .map_err(|e| ClusterError::classify(e, "Pod", name))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| ClusterError::classify(e, "Service", name))
    }

    /// Replace a Service, carrying over the fields the API server owns
    ///
    /// `resourceVersion` and the cluster IP fields come from the live object;
    /// the API server rejects an update that drops them.
    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = object_name(&service.metadata.name, "Service")?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        let live = api
            .get(name)
            .await
            .map_err(|e| ClusterError::classify(e, "Service", name))?;

        let mut desired = service.clone();
        desired.metadata.resource_version = live.metadata.resource_version;
        if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec) {
            spec.cluster_ip = live_spec.cluster_ip;
            spec.cluster_ips = live_spec.cluster_ips;
            spec.ip_families = live_spec.ip_families;
            spec.ip_family_policy = live_spec.ip_family_policy;
        }

        api.replace(name, &PostParams::default(), &desired)
            .await
            .map_err(|e| ClusterError::classify(e, "Service", name))
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = object_name(&service.metadata.name, "Service")?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service)
            .await
            .map_err(|e| ClusterError::classify(e, "Service", name))
    }
}

/// In-memory `ClusterApi` for tests
///
/// Namespaces are ignored: every test works against a single namespace.
#[cfg(test)]
#[derive(Default)]
pub struct MockCluster {
    state: std::sync::Mutex<MockClusterState>,
}

#[cfg(test)]
#[derive(Default)]
struct MockClusterState {
    endpoint_slices: Vec<EndpointSlice>,
    pods: std::collections::BTreeMap<String, Pod>,
    services: std::collections::BTreeMap<String, Service>,
    /// Remaining conflicts to return per pod name
    pod_conflicts: std::collections::BTreeMap<String, u32>,
    /// Pods and Services whose replace fails with a non-conflict API error
    failing_writes: std::collections::BTreeSet<String>,
    pod_writes: Vec<String>,
    service_creates: Vec<String>,
    service_replaces: Vec<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint_slice(&self, slice: EndpointSlice) {
        self.state.lock().unwrap().endpoint_slices.push(slice);
    }

    pub fn add_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap();
        self.state.lock().unwrap().pods.insert(name, pod);
    }

    pub fn add_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap();
        self.state.lock().unwrap().services.insert(name, service);
    }

    /// Make the next `count` writes of `pod` fail with a conflict
    pub fn fail_pod_writes_with_conflict(&self, pod: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .pod_conflicts
            .insert(pod.to_string(), count);
    }

    /// Make every replace of the pod or Service `name` fail as if the API
    /// server were unreachable
    pub fn fail_writes_of(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(name.to_string());
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state.lock().unwrap().pods.get(name).cloned()
    }

    pub fn pod_labels(&self, name: &str) -> std::collections::BTreeMap<String, String> {
        self.pod(name)
            .and_then(|p| p.metadata.labels)
            .unwrap_or_default()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.state.lock().unwrap().services.get(name).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.state.lock().unwrap().services.keys().cloned().collect()
    }

    /// Names of pods successfully written, in order
    pub fn pod_writes(&self) -> Vec<String> {
        self.state.lock().unwrap().pod_writes.clone()
    }

    pub fn service_creates(&self) -> Vec<String> {
        self.state.lock().unwrap().service_creates.clone()
    }

    pub fn service_replaces(&self) -> Vec<String> {
        self.state.lock().unwrap().service_replaces.clone()
    }
}

#[cfg(test)]
fn unavailable() -> ClusterError {
    ClusterError::KubeError(kube::Error::Service("apiserver unavailable".into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl ClusterApi for MockCluster {
    async fn list_endpoint_slices(
        &self,
        _namespace: &str,
    ) -> Result<Vec<EndpointSlice>, ClusterError> {
        Ok(self.state.lock().unwrap().endpoint_slices.clone())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.pod(name).ok_or(ClusterError::NotFound {
            kind: "Pod",
            name: name.to_string(),
        })
    }

    async fn replace_pod(&self, _namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        let name = object_name(&pod.metadata.name, "Pod")?.to_string();
        let mut state = self.state.lock().unwrap();

        if state.failing_writes.contains(&name) {
            return Err(unavailable());
        }

        if let Some(remaining) = state.pod_conflicts.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClusterError::Conflict {
                    kind: "Pod",
                    name,
                    message: "the object has been modified".to_string(),
                });
            }
        }

        if !state.pods.contains_key(&name) {
            return Err(ClusterError::NotFound { kind: "Pod", name });
        }
        state.pods.insert(name.clone(), pod.clone());
        state.pod_writes.push(name);
        Ok(pod.clone())
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Service, ClusterError> {
        self.service(name).ok_or(ClusterError::NotFound {
            kind: "Service",
            name: name.to_string(),
        })
    }

    async fn replace_service(
        &self,
        _namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = object_name(&service.metadata.name, "Service")?.to_string();
        let mut state = self.state.lock().unwrap();
        if state.failing_writes.contains(&name) {
            return Err(unavailable());
        }
        if !state.services.contains_key(&name) {
            return Err(ClusterError::NotFound {
                kind: "Service",
                name,
            });
        }
        state.services.insert(name.clone(), service.clone());
        state.service_replaces.push(name);
        Ok(service.clone())
    }

    async fn create_service(
        &self,
        _namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = object_name(&service.metadata.name, "Service")?.to_string();
        let mut state = self.state.lock().unwrap();
        if state.services.contains_key(&name) {
            return Err(ClusterError::Conflict {
                kind: "Service",
                name,
                message: "already exists".to_string(),
            });
        }
        state.services.insert(name.clone(), service.clone());
        state.service_creates.push(name);
        Ok(service.clone())
    }
}
