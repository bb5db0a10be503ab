//! Controller configuration

use crate::error::{OperatorError, Result};
use crate::plan::{BuildSettings, Component, ConvergencePlan, Step, UpdatePolicy};
use crate::resources::{DEFAULT_ENVOY_IMAGE, MANAGED_BY, MANAGED_BY_LABEL};
use crate::sidecar::DEFAULT_ENVOY_CONFIG_PATH;
use std::path::PathBuf;
use std::time::Duration;

/// Work queue rate limiting
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// First per-item retry delay
    pub base_delay: Duration,
    /// Per-item retry delay ceiling
    pub max_delay: Duration,
    /// Sustained retries per second across all items
    pub qps: f64,
    /// Retry burst across all items
    pub burst: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 50.0,
            burst: 300,
        }
    }
}

/// Update policy per component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyConfig {
    pub primary_workload: UpdatePolicy,
    pub primary_service: UpdatePolicy,
    pub sidecar_config: UpdatePolicy,
    pub sidecar_workload: UpdatePolicy,
    pub sidecar_service: UpdatePolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let plan = ConvergencePlan::default();
        let policy = |c: Component| plan.policy(c).unwrap_or(UpdatePolicy::CreateOnly);
        Self {
            primary_workload: policy(Component::PrimaryWorkload),
            primary_service: policy(Component::PrimaryService),
            sidecar_config: policy(Component::SidecarConfig),
            sidecar_workload: policy(Component::SidecarWorkload),
            sidecar_service: policy(Component::SidecarService),
        }
    }
}

impl PolicyConfig {
    /// Apply one policy to both services
    pub fn with_service_policy(mut self, policy: UpdatePolicy) -> Self {
        self.primary_service = policy;
        self.sidecar_service = policy;
        self
    }

    /// Plan in the fixed component order with these policies
    pub fn plan(&self) -> ConvergencePlan {
        ConvergencePlan::new(
            Component::ALL
                .iter()
                .map(|&component| Step {
                    component,
                    policy: match component {
                        Component::PrimaryWorkload => self.primary_workload,
                        Component::PrimaryService => self.primary_service,
                        Component::SidecarConfig => self.sidecar_config,
                        Component::SidecarWorkload => self.sidecar_workload,
                        Component::SidecarService => self.sidecar_service,
                    },
                })
                .collect(),
        )
    }
}

/// Everything the controller needs besides a client
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Number of parallel workers
    pub workers: usize,
    pub queue: QueueConfig,
    pub policies: PolicyConfig,
    /// Envoy configuration document stored in the sidecar ConfigMap
    pub envoy_config_path: PathBuf,
    pub envoy_image: String,
    /// Fixed node port of the primary Service
    pub primary_node_port: Option<i32>,
    /// Label selector scoping the managed-object watches
    pub managed_selector: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 2,
            queue: QueueConfig::default(),
            policies: PolicyConfig::default(),
            envoy_config_path: PathBuf::from(DEFAULT_ENVOY_CONFIG_PATH),
            envoy_image: DEFAULT_ENVOY_IMAGE.to_string(),
            primary_node_port: None,
            managed_selector: format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY),
        }
    }
}

impl ControllerConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(OperatorError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        if self.queue.qps <= 0.0 || self.queue.burst == 0 {
            return Err(OperatorError::InvalidConfig(
                "queue qps and burst must be positive".to_string(),
            ));
        }
        if self.queue.base_delay > self.queue.max_delay {
            return Err(OperatorError::InvalidConfig(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.queue.base_delay, self.queue.max_delay
            )));
        }
        if let Some(port) = self.primary_node_port {
            if !(30000..=32767).contains(&port) {
                return Err(OperatorError::InvalidConfig(format!(
                    "node port {} is outside the default range 30000-32767",
                    port
                )));
            }
        }
        if self.envoy_image.trim().is_empty() {
            return Err(OperatorError::InvalidConfig(
                "envoy image must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            envoy_image: self.envoy_image.clone(),
            primary_node_port: self.primary_node_port,
        }
    }
}
