//! Convergence plan
//!
//! A Book converges through an ordered list of components. Each component
//! knows its kind, its derived name and how to build its desired object;
//! the plan pairs it with the update policy applied when the object already
//! exists.

use crate::resources::{
    self, config_map_drift, deployment_drift, service_drift, DriftField, ResourceBuilder,
};
use crate::store::{ManagedKind, ManagedObject};
use std::fmt;
use std::str::FromStr;

/// What to do with a managed object that already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Never revised after creation
    CreateOnly,
    /// Overwritten when a compared field drifted
    DiffGated,
    /// Overwritten on every sync
    AlwaysUpdate,
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdatePolicy::CreateOnly => "create-only",
            UpdatePolicy::DiffGated => "diff-gated",
            UpdatePolicy::AlwaysUpdate => "always-update",
        })
    }
}

impl FromStr for UpdatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-only" => Ok(UpdatePolicy::CreateOnly),
            "diff-gated" => Ok(UpdatePolicy::DiffGated),
            "always-update" => Ok(UpdatePolicy::AlwaysUpdate),
            other => Err(format!(
                "unknown update policy '{}' (expected create-only, diff-gated or always-update)",
                other
            )),
        }
    }
}

/// A managed object derived from every Book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    PrimaryWorkload,
    PrimaryService,
    SidecarConfig,
    SidecarWorkload,
    SidecarService,
}

/// Inputs to desired-object construction that do not come from the Book
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSettings {
    pub envoy_image: String,
    pub primary_node_port: Option<i32>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            envoy_image: resources::DEFAULT_ENVOY_IMAGE.to_string(),
            primary_node_port: None,
        }
    }
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::PrimaryWorkload,
        Component::PrimaryService,
        Component::SidecarConfig,
        Component::SidecarWorkload,
        Component::SidecarService,
    ];

    pub fn kind(&self) -> ManagedKind {
        match self {
            Component::PrimaryWorkload | Component::SidecarWorkload => ManagedKind::Deployment,
            Component::PrimaryService | Component::SidecarService => ManagedKind::Service,
            Component::SidecarConfig => ManagedKind::ConfigMap,
        }
    }

    /// Name of this component's object for the given `deploymentName`
    pub fn object_name(&self, deployment_name: &str) -> String {
        match self {
            Component::PrimaryWorkload => resources::primary_workload_name(deployment_name),
            Component::PrimaryService => resources::primary_service_name(deployment_name),
            Component::SidecarConfig => resources::sidecar_config_name(deployment_name),
            Component::SidecarWorkload => resources::sidecar_workload_name(deployment_name),
            Component::SidecarService => resources::sidecar_service_name(deployment_name),
        }
    }

    /// True when building the desired object needs the sidecar document
    pub fn needs_sidecar_document(&self) -> bool {
        matches!(self, Component::SidecarConfig)
    }

    /// Build the desired object. `document` is only read by the sidecar config.
    pub fn desired(
        &self,
        builder: &ResourceBuilder<'_>,
        settings: &BuildSettings,
        document: Option<String>,
    ) -> ManagedObject {
        match self {
            Component::PrimaryWorkload => ManagedObject::Deployment(builder.primary_deployment()),
            Component::PrimaryService => {
                ManagedObject::Service(builder.primary_service(settings.primary_node_port))
            }
            Component::SidecarConfig => {
                ManagedObject::ConfigMap(builder.sidecar_config_map(document.unwrap_or_default()))
            }
            Component::SidecarWorkload => {
                ManagedObject::Deployment(builder.sidecar_deployment(&settings.envoy_image))
            }
            Component::SidecarService => ManagedObject::Service(builder.sidecar_service()),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Component::PrimaryWorkload => "primary-workload",
            Component::PrimaryService => "primary-service",
            Component::SidecarConfig => "sidecar-config",
            Component::SidecarWorkload => "sidecar-workload",
            Component::SidecarService => "sidecar-service",
        })
    }
}

/// Fields on which `observed` diverges from `desired`.
///
/// Objects of different kinds are reported as drifted on every field that
/// could be compared.
pub fn drift(desired: &ManagedObject, observed: &ManagedObject) -> Vec<DriftField> {
    match (desired, observed) {
        (ManagedObject::Deployment(d), ManagedObject::Deployment(o)) => deployment_drift(d, o),
        (ManagedObject::Service(d), ManagedObject::Service(o)) => service_drift(d, o),
        (ManagedObject::ConfigMap(d), ManagedObject::ConfigMap(o)) => config_map_drift(d, o),
        _ => vec![DriftField::Data],
    }
}

/// One step of the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub component: Component,
    pub policy: UpdatePolicy,
}

/// Ordered steps applied on every sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergencePlan {
    steps: Vec<Step>,
}

impl ConvergencePlan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Policy configured for a component, if it is part of the plan
    pub fn policy(&self, component: Component) -> Option<UpdatePolicy> {
        self.steps
            .iter()
            .find(|s| s.component == component)
            .map(|s| s.policy)
    }

    /// Plan with every existing object left alone unless it drifted
    pub fn diff_gated() -> Self {
        let mut plan = Self::default();
        for step in &mut plan.steps {
            if step.policy == UpdatePolicy::AlwaysUpdate {
                step.policy = UpdatePolicy::DiffGated;
            }
        }
        plan
    }
}

impl Default for ConvergencePlan {
    fn default() -> Self {
        Self::new(vec![
            Step {
                component: Component::PrimaryWorkload,
                policy: UpdatePolicy::DiffGated,
            },
            Step {
                component: Component::PrimaryService,
                policy: UpdatePolicy::AlwaysUpdate,
            },
            Step {
                component: Component::SidecarConfig,
                policy: UpdatePolicy::CreateOnly,
            },
            Step {
                component: Component::SidecarWorkload,
                policy: UpdatePolicy::CreateOnly,
            },
            Step {
                component: Component::SidecarService,
                policy: UpdatePolicy::AlwaysUpdate,
            },
        ])
    }
}
