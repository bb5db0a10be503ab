//! Kubernetes Resource Builders
//!
//! This module generates the managed objects (Deployments, Services and the
//! Envoy ConfigMap) from a Book. Builders are pure: the same Book always
//! yields identical objects.

use crate::crd::{Book, BookContainer};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Label marking objects created by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "book-operator";

/// Label carrying the owning Book's name
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Default Envoy image for the sidecar workload
pub const DEFAULT_ENVOY_IMAGE: &str = "envoyproxy/envoy:v1.32.3";

/// Key of the Envoy document inside the sidecar ConfigMap
pub const ENVOY_CONFIG_KEY: &str = "envoy.yaml";

/// Envoy listener port
pub const ENVOY_HTTP_PORT: i32 = 1999;

/// Envoy admin port
pub const ENVOY_ADMIN_PORT: i32 = 8001;

const ENVOY_CONFIG_VOLUME: &str = "envoy-config";
const ENVOY_CONFIG_MOUNT: &str = "/etc/envoy";

/// Name of the primary Deployment
pub fn primary_workload_name(deployment_name: &str) -> String {
    deployment_name.to_string()
}

/// Name of the primary Service
pub fn primary_service_name(deployment_name: &str) -> String {
    format!("{}service", deployment_name)
}

/// Name of the sidecar Deployment
pub fn sidecar_workload_name(deployment_name: &str) -> String {
    format!("{}-envoy", deployment_name)
}

/// Name of the sidecar ConfigMap
pub fn sidecar_config_name(deployment_name: &str) -> String {
    format!("{}-envoy-config", deployment_name)
}

/// Name of the sidecar Service
pub fn sidecar_service_name(deployment_name: &str) -> String {
    format!("{}-envoy-service", deployment_name)
}

/// Builder for generating managed resources from a Book
pub struct ResourceBuilder<'a> {
    book: &'a Book,
    name: String,
    namespace: String,
    owner: OwnerReference,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(book: &'a Book) -> Result<Self> {
        let name = book
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("book name is required".to_string()))?;

        let namespace = book.metadata.namespace.clone().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("book '{}' has no namespace", name))
        })?;

        let owner = book.owner_reference().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("book '{}' has no uid yet", name))
        })?;

        Ok(Self {
            book,
            name,
            namespace,
            owner,
        })
    }

    /// Namespace every managed object lands in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn deployment_name(&self) -> &str {
        &self.book.spec.deployment_name
    }

    /// Metadata shared by every managed object
    fn metadata(&self, name: String) -> ObjectMeta {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        labels.insert(INSTANCE_LABEL.to_string(), self.name.clone());

        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    /// Pod labels of the primary workload
    pub fn primary_labels(&self) -> BTreeMap<String, String> {
        self.pod_labels("book-server")
    }

    /// Pod labels of the sidecar workload
    pub fn sidecar_labels(&self) -> BTreeMap<String, String> {
        self.pod_labels("envoy")
    }

    fn pod_labels(&self, app: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        labels.insert("controller".to_string(), self.name.clone());
        labels
    }

    /// Build the primary Deployment
    pub fn primary_deployment(&self) -> Deployment {
        let labels = self.primary_labels();
        let container = self.build_container(&self.book.spec.container);

        Deployment {
            metadata: self.metadata(primary_workload_name(self.deployment_name())),
            spec: Some(DeploymentSpec {
                replicas: self.book.spec.replicas,
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Convert the Book's container into a Kubernetes container
    fn build_container(&self, container: &BookContainer) -> Container {
        let ports = container
            .ports
            .iter()
            .map(|p| ContainerPort {
                name: p.name.clone(),
                container_port: p.container_port,
                protocol: p.protocol.clone(),
                ..Default::default()
            })
            .collect();

        Container {
            name: container
                .name
                .clone()
                .unwrap_or_else(|| self.deployment_name().to_string()),
            image: Some(container.image.clone()),
            image_pull_policy: container.image_pull_policy.clone(),
            ports: Some(ports),
            ..Default::default()
        }
    }

    /// Build the NodePort Service exposing the primary workload.
    ///
    /// `node_port` pins the node port; when unset the cluster allocates one.
    pub fn primary_service(&self, node_port: Option<i32>) -> Service {
        let port = self
            .book
            .spec
            .primary_port()
            .map(|p| p.container_port)
            .unwrap_or_default();

        Service {
            metadata: self.metadata(primary_service_name(self.deployment_name())),
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(self.primary_labels()),
                ports: Some(vec![ServicePort {
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    node_port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the ConfigMap carrying the Envoy configuration document
    pub fn sidecar_config_map(&self, document: String) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(ENVOY_CONFIG_KEY.to_string(), document);

        ConfigMap {
            metadata: self.metadata(sidecar_config_name(self.deployment_name())),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Build the Envoy sidecar Deployment
    pub fn sidecar_deployment(&self, image: &str) -> Deployment {
        let labels = self.sidecar_labels();
        let name = sidecar_workload_name(self.deployment_name());

        let container = Container {
            name: name.clone(),
            image: Some(image.to_string()),
            ports: Some(vec![
                ContainerPort {
                    name: Some("http".to_string()),
                    container_port: ENVOY_HTTP_PORT,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("admin".to_string()),
                    container_port: ENVOY_ADMIN_PORT,
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: ENVOY_CONFIG_VOLUME.to_string(),
                mount_path: ENVOY_CONFIG_MOUNT.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let volume = Volume {
            name: ENVOY_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: sidecar_config_name(self.deployment_name()),
                ..Default::default()
            }),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(name),
            spec: Some(DeploymentSpec {
                replicas: self.book.spec.replicas,
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![volume]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the LoadBalancer Service in front of the sidecar
    pub fn sidecar_service(&self) -> Service {
        Service {
            metadata: self.metadata(sidecar_service_name(self.deployment_name())),
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                selector: Some(self.sidecar_labels()),
                ports: Some(vec![ServicePort {
                    port: ENVOY_HTTP_PORT,
                    target_port: Some(IntOrString::Int(ENVOY_HTTP_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// A field on which observed state diverged from the desired object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftField {
    Replicas,
    Image,
    Port,
    ServiceType,
    Selector,
    ServicePorts,
    Data,
}

fn first_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
}

fn first_port(container: Option<&Container>) -> Option<i32> {
    container
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.container_port)
}

/// Compare a desired Deployment against the observed one.
///
/// Only replicas, the first container's image and its first port are
/// compared. Replicas are only compared when the desired object sets them,
/// so an unset `spec.replicas` on the Book leaves manual scaling alone.
pub fn deployment_drift(desired: &Deployment, observed: &Deployment) -> Vec<DriftField> {
    let mut drift = Vec::new();

    let desired_replicas = desired.spec.as_ref().and_then(|s| s.replicas);
    let observed_replicas = observed.spec.as_ref().and_then(|s| s.replicas);
    if desired_replicas.is_some() && desired_replicas != observed_replicas {
        drift.push(DriftField::Replicas);
    }

    let desired_container = first_container(desired);
    let observed_container = first_container(observed);

    let desired_image = desired_container.and_then(|c| c.image.as_deref());
    if desired_image.is_some_and(|i| !i.is_empty())
        && desired_image != observed_container.and_then(|c| c.image.as_deref())
    {
        drift.push(DriftField::Image);
    }

    if first_port(desired_container) != first_port(observed_container) {
        drift.push(DriftField::Port);
    }

    drift
}

/// Compare a desired Service against the observed one.
///
/// Node ports are compared only when the desired Service pins one; allocated
/// values (cluster IP, node ports) are otherwise owned by the API server.
pub fn service_drift(desired: &Service, observed: &Service) -> Vec<DriftField> {
    let mut drift = Vec::new();
    let desired_spec = desired.spec.clone().unwrap_or_default();
    let observed_spec = observed.spec.clone().unwrap_or_default();

    if desired_spec.type_ != observed_spec.type_ {
        drift.push(DriftField::ServiceType);
    }
    if desired_spec.selector != observed_spec.selector {
        drift.push(DriftField::Selector);
    }

    let desired_ports = desired_spec.ports.unwrap_or_default();
    let observed_ports = observed_spec.ports.unwrap_or_default();
    let ports_match = desired_ports.len() == observed_ports.len()
        && desired_ports.iter().zip(&observed_ports).all(|(d, o)| {
            d.port == o.port
                && d.target_port == o.target_port
                && (d.node_port.is_none() || d.node_port == o.node_port)
        });
    if !ports_match {
        drift.push(DriftField::ServicePorts);
    }

    drift
}

/// Compare a desired ConfigMap's data against the observed one
pub fn config_map_drift(desired: &ConfigMap, observed: &ConfigMap) -> Vec<DriftField> {
    if desired.data != observed.data {
        vec![DriftField::Data]
    } else {
        Vec::new()
    }
}
