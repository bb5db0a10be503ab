//! Custom Resource Definition for the Book operator
//!
//! A `Book` declares a server workload by image and ports. The operator
//! derives every managed object name from `spec.deploymentName`, so the
//! validation here also guarantees that the longest derived name still fits
//! a Kubernetes label.

use crate::key::ObjectKey;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the Book resource
pub const BOOK_GROUP: &str = "simplecustomcontroller.crd.com";

/// Kind name used in owner references
pub const BOOK_KIND: &str = "Book";

/// Longest suffix appended to `deploymentName` when naming managed resources
const LONGEST_DERIVED_SUFFIX: &str = "-envoy-service";

/// Maximum number of ports on the primary container
const MAX_PORTS: usize = 16;

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("name regex is valid")
});

/// Book custom resource definition
///
/// Each Book produces a primary Deployment and Service plus an Envoy sidecar
/// Deployment, its ConfigMap and its Service.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "simplecustomcontroller.crd.com",
    version = "v1",
    kind = "Book",
    plural = "books",
    namespaced,
    status = "BookStatus",
    printcolumn = r#"{"name":"Deployment", "type":"string", "jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BookSpec {
    /// Name of the primary Deployment; every other managed name derives from it
    #[serde(default)]
    #[validate(custom(function = "validate_deployment_name"))]
    pub deployment_name: String,

    /// Desired replica count of the primary and sidecar workloads
    #[serde(default)]
    #[validate(range(min = 0, message = "replicas must not be negative"))]
    pub replicas: Option<i32>,

    /// Primary container
    #[validate(nested)]
    pub container: BookContainer,
}

/// The subset of a container the operator manages
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BookContainer {
    /// Container name (defaults to the deployment name)
    #[serde(default)]
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: Option<String>,

    /// Container image reference
    #[validate(custom(function = "validate_image"))]
    pub image: String,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default)]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: Option<String>,

    /// Exposed ports; the first one is published by the primary Service
    #[serde(default)]
    #[validate(custom(function = "validate_ports"))]
    pub ports: Vec<BookContainerPort>,
}

/// A container port
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookContainerPort {
    /// Optional port name
    #[serde(default)]
    pub name: Option<String>,

    /// Port number inside the container
    pub container_port: i32,

    /// Protocol (TCP, UDP, SCTP)
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Observed state of a Book
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BookStatus {
    /// Available replicas of the primary Deployment at the last successful sync
    #[serde(default)]
    pub available_replicas: i32,
}

/// Validate the deployment name and the names derived from it
fn validate_deployment_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("deployment_name_required")
            .with_message("deploymentName must be set".into()));
    }
    let longest = value.len() + LONGEST_DERIVED_SUFFIX.len();
    if longest > 63 {
        return Err(ValidationError::new("deployment_name_too_long").with_message(
            format!(
                "deploymentName '{}' is too long: derived name would be {} characters (max 63)",
                value, longest
            )
            .into(),
        ));
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a Kubernetes name (RFC 1123 label)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(
            ValidationError::new("image_required").with_message("container image must be set".into())
        );
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..")
        || value.starts_with('/')
        || value.starts_with('-')
        || value.chars().any(char::is_whitespace)
    {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message(format!("'{}' is not a valid image pull policy", policy).into())),
    }
}

/// Validate the container port list
fn validate_ports(ports: &[BookContainerPort]) -> Result<(), ValidationError> {
    if ports.is_empty() {
        return Err(ValidationError::new("ports_required")
            .with_message("container must expose at least one port".into()));
    }
    if ports.len() > MAX_PORTS {
        return Err(ValidationError::new("too_many_ports")
            .with_message(format!("maximum {} ports allowed", MAX_PORTS).into()));
    }
    for port in ports {
        if !(1..=65535).contains(&port.container_port) {
            return Err(ValidationError::new("invalid_port").with_message(
                format!("containerPort {} is out of range 1-65535", port.container_port).into(),
            ));
        }
        if let Some(protocol) = port.protocol.as_deref() {
            if !matches!(protocol, "TCP" | "UDP" | "SCTP") {
                return Err(ValidationError::new("invalid_protocol")
                    .with_message(format!("'{}' is not a valid protocol", protocol).into()));
            }
        }
    }
    Ok(())
}

impl BookSpec {
    /// Validate the spec, flattening the error tree into one message
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|errors| errors.to_string())
    }

    /// First declared container port, published by the primary Service
    pub fn primary_port(&self) -> Option<&BookContainerPort> {
        self.container.ports.first()
    }
}

impl Book {
    /// Reconciliation key of this Book, if it is namespaced and named
    pub fn key(&self) -> Option<ObjectKey> {
        ObjectKey::for_resource(self)
    }

    /// Controller owner reference placed on every managed resource.
    ///
    /// Returns `None` until the API server has assigned a uid.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let mut owner = self.controller_owner_ref(&())?;
        owner.block_owner_deletion = Some(true);
        Some(owner)
    }

    /// True if `owner` points at this Book as controller
    pub fn controls(&self, owner: &OwnerReference) -> bool {
        owner.controller == Some(true)
            && owner.kind == BOOK_KIND
            && self.uid().is_some_and(|uid| uid == owner.uid)
    }
}
