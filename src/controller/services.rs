//! Role-selecting Services
//!
//! From the member-set Service (the template) two Services are derived,
//! `{name}-primary` and `{name}-standby`, each selecting pods by the role
//! label. They are upserted every cycle and never deleted.

use super::cluster::{ClusterApi, ClusterError};
use super::topology::{Role, ROLE_LABEL_KEY};
use crate::config::APP_NAME;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Label prefixes of tools that would revert our changes to derived Services
pub const STRIPPED_LABEL_PREFIXES: &[&str] = &["helm.sh"];

/// Roles that get a derived Service, in publish order
pub const PUBLISHED_ROLES: [Role; 2] = [Role::Primary, Role::Standby];

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Template Service '{name}' not found")]
    TemplateNotFound { name: String },

    #[error("Error getting '{name}' pg service: {source}")]
    TemplateLookup {
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("Template Service '{name}' has no selector")]
    TemplateWithoutSelector { name: String },

    #[error("Cannot derive a Service for an unresolved role")]
    UnresolvedRole,

    #[error("Error updating '{name}' service: {source}")]
    Update {
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("Error creating '{name}' service: {source}")]
    Create {
        name: String,
        #[source]
        source: ClusterError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Result of one publish pass; per-role failures do not stop the other role
#[derive(Debug, Default)]
pub struct PublishReport {
    pub upserted: Vec<(String, UpsertOutcome)>,
    pub failures: Vec<PublishError>,
}

/// Name of the Service selecting members with `role_value`
pub fn role_service_name(template_name: &str, role_value: &str) -> String {
    format!("{}-{}", template_name, role_value)
}

/// Template labels minus third-party management markers, plus our own
pub fn managed_labels(template_labels: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = template_labels
        .into_iter()
        .flatten()
        .filter(|(key, _)| {
            !STRIPPED_LABEL_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    labels.insert(MANAGED_BY_LABEL_KEY.to_string(), APP_NAME.to_string());
    labels
}

/// Build the Service selecting members with `role` from the template
///
/// Ports are copied without `nodePort`, since derived Services are ClusterIP.
pub fn derive_role_service(template: &Service, role: Role) -> Result<Service, PublishError> {
    let template_name = template.metadata.name.clone().unwrap_or_default();
    let role_value = role.label_value().ok_or(PublishError::UnresolvedRole)?;

    let template_spec = template.spec.as_ref();
    let mut selector = template_spec
        .and_then(|spec| spec.selector.clone())
        .filter(|selector| !selector.is_empty())
        .ok_or_else(|| PublishError::TemplateWithoutSelector {
            name: template_name.clone(),
        })?;
    selector.insert(ROLE_LABEL_KEY.to_string(), role_value.to_string());

    let ports = template_spec.and_then(|spec| spec.ports.clone()).map(|ports| {
        ports
            .into_iter()
            .map(|port| ServicePort {
                node_port: None,
                ..port
            })
            .collect::<Vec<_>>()
    });

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(role_service_name(&template_name, role_value)),
            namespace: template.metadata.namespace.clone(),
            labels: Some(managed_labels(template.metadata.labels.as_ref())),
            annotations: Some(BTreeMap::new()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports,
            selector: Some(selector),
            ..Default::default()
        }),
        status: None,
    })
}

/// Update the Service, creating it if it does not exist yet
pub async fn upsert_service(
    cluster: &dyn ClusterApi,
    namespace: &str,
    service: &Service,
) -> Result<UpsertOutcome, PublishError> {
    let name = service.metadata.name.clone().unwrap_or_default();

    match cluster.replace_service(namespace, service).await {
        Ok(_) => Ok(UpsertOutcome::Updated),
        Err(e) if e.is_not_found() => {
            cluster
                .create_service(namespace, service)
                .await
                .map_err(|source| PublishError::Create { name, source })?;
            Ok(UpsertOutcome::Created)
        }
        Err(source) => Err(PublishError::Update { name, source }),
    }
}

/// Publish the primary and standby Services for the member set
///
/// # Errors
/// Fails as a whole only when the template cannot be used; failures of a
/// single derived Service are collected in the report.
pub async fn publish_role_services(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
) -> Result<PublishReport, PublishError> {
    let template = cluster
        .get_service(namespace, name)
        .await
        .map_err(|source| match source {
            ClusterError::NotFound { .. } => PublishError::TemplateNotFound {
                name: name.to_string(),
            },
            source => PublishError::TemplateLookup {
                name: name.to_string(),
                source,
            },
        })?;

    let mut report = PublishReport::default();

    for role in PUBLISHED_ROLES {
        let service = derive_role_service(&template, role)?;
        let service_name = service.metadata.name.clone().unwrap_or_default();

        match upsert_service(cluster, namespace, &service).await {
            Ok(outcome) => {
                info!(service = %service_name, outcome = ?outcome, "Published role service");
                report.upserted.push((service_name, outcome));
            }
            Err(e) => {
                warn!(service = %service_name, error = %e, "Failed to publish role service");
                report.failures.push(e);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::controller::cluster::MockCluster;

    pub(crate) fn template_service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(
                    [
                        ("app", "db"),
                        ("helm.sh/chart", "postgresql-12.1.0"),
                        (MANAGED_BY_LABEL_KEY, "Helm"),
                    ]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ),
                resource_version: Some("4711".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                cluster_ip: Some("10.96.0.10".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("tcp-postgresql".to_string()),
                    port: 5432,
                    node_port: Some(30432),
                    ..Default::default()
                }]),
                selector: Some(
                    [("app", "db")]
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_managed_labels_strip_helm_and_mark_owner() {
        let template = template_service("pg-set");

        let labels = managed_labels(template.metadata.labels.as_ref());

        assert_eq!(labels.get("app").map(String::as_str), Some("db"));
        assert!(!labels.contains_key("helm.sh/chart"));
        assert_eq!(
            labels.get(MANAGED_BY_LABEL_KEY).map(String::as_str),
            Some(APP_NAME)
        );
    }

    #[test]
    fn test_derive_primary_service() {
        let template = template_service("pg-set");

        let service = derive_role_service(&template, Role::Primary).unwrap();
        let spec = service.spec.unwrap();

        assert_eq!(service.metadata.name.as_deref(), Some("pg-set-primary"));
        assert_eq!(service.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(service.metadata.resource_version, None);
        assert_eq!(service.metadata.annotations, Some(BTreeMap::new()));
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.cluster_ip, None);

        let selector = spec.selector.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("db"));
        assert_eq!(
            selector.get(ROLE_LABEL_KEY).map(String::as_str),
            Some("primary")
        );

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 5432);
        assert_eq!(ports[0].node_port, None);
    }

    #[test]
    fn test_derive_leaves_template_untouched() {
        let template = template_service("pg-set");
        let before = template.clone();

        let _ = derive_role_service(&template, Role::Standby).unwrap();

        assert_eq!(template, before);
    }

    #[test]
    fn test_derive_requires_selector() {
        let mut template = template_service("pg-set");
        template.spec.as_mut().unwrap().selector = None;

        let result = derive_role_service(&template, Role::Primary);

        assert!(matches!(result, Err(PublishError::TemplateWithoutSelector { .. })));
    }

    #[tokio::test]
    async fn test_publish_creates_then_updates() {
        let cluster = MockCluster::new();
        cluster.add_service(template_service("pg-set"));

        let first = publish_role_services(&cluster, "ns", "pg-set").await.unwrap();
        let after_first = cluster.service("pg-set-primary").unwrap();
        let second = publish_role_services(&cluster, "ns", "pg-set").await.unwrap();

        assert!(first.failures.is_empty());
        assert_eq!(
            first.upserted,
            vec![
                ("pg-set-primary".to_string(), UpsertOutcome::Created),
                ("pg-set-standby".to_string(), UpsertOutcome::Created),
            ]
        );
        assert!(second.failures.is_empty());
        assert_eq!(
            second.upserted,
            vec![
                ("pg-set-primary".to_string(), UpsertOutcome::Updated),
                ("pg-set-standby".to_string(), UpsertOutcome::Updated),
            ]
        );
        assert_eq!(
            cluster.service_names(),
            vec![
                "pg-set".to_string(),
                "pg-set-primary".to_string(),
                "pg-set-standby".to_string()
            ]
        );
        assert_eq!(cluster.service("pg-set-primary").unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_publish_failure_of_one_role_keeps_the_other() {
        let cluster = MockCluster::new();
        cluster.add_service(template_service("pg-set"));
        cluster.fail_writes_of("pg-set-primary");

        let report = publish_role_services(&cluster, "ns", "pg-set").await.unwrap();

        assert_eq!(
            report.upserted,
            vec![("pg-set-standby".to_string(), UpsertOutcome::Created)]
        );
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            PublishError::Update { name, .. } if name == "pg-set-primary"
        ));
        assert!(cluster.service("pg-set-primary").is_none());
        assert_eq!(cluster.service_creates(), vec!["pg-set-standby".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_without_template() {
        let cluster = MockCluster::new();

        let result = publish_role_services(&cluster, "ns", "pg-set").await;

        assert!(matches!(result, Err(PublishError::TemplateNotFound { ref name }) if name == "pg-set"));
        assert!(cluster.service_creates().is_empty());
    }
}
