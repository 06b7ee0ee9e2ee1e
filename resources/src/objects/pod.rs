use std::collections::HashMap;

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::{metrics::Resource, Metadata, Object};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Pod {
    pub metadata: Metadata,
    pub spec: PodSpec,
    pub status: Option<PodStatus>,
}

impl Object for Pod {
    fn kind(&self) -> &'static str {
        "Pod"
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Pod {
    /// Sum of the requests of `resource` over the pod's containers,
    /// or of the single container named `container`.
    pub fn requests(&self, resource: &Resource, container: Option<&str>) -> Result<i64> {
        let mut total = 0;
        let mut found = false;
        for c in &self.spec.containers {
            if container.map_or(false, |name| name != c.name) {
                continue;
            }
            found = true;
            let request = c.resources.requests.get(resource).ok_or_else(|| {
                anyhow!(
                    "missing request for {} in container {} of pod {}",
                    resource,
                    c.name,
                    self.metadata.name
                )
            })?;
            total += request;
        }
        if !found {
            return Err(anyhow!(
                "container {} not found in pod {}",
                container.unwrap_or_default(),
                self.metadata.name
            ));
        }
        Ok(total)
    }

    pub fn phase(&self) -> PodPhase {
        self.status
            .as_ref()
            .map_or(PodPhase::Pending, |status| status.phase.clone())
    }

    pub fn condition(&self, type_: &PodConditionType) -> Option<&PodCondition> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.get(type_))
    }

    pub fn is_ready(&self) -> bool {
        self.condition(&PodConditionType::Ready)
            .map_or(false, |c| c.status)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// List of containers belonging to the pod.
    pub containers: Vec<Container>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Name of the container specified as a DNS_LABEL.
    /// Each container in a pod must have a unique name (DNS_LABEL).
    pub name: String,
    /// Compute Resources required by this container.
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ResourceRequirements {
    /// Minimum amount of compute resources required, in milli-units.
    #[serde(default)]
    pub requests: HashMap<Resource, i64>,
    /// Maximum amount of compute resources allowed, in milli-units.
    #[serde(default)]
    pub limits: HashMap<Resource, i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    /// The phase of a Pod is a simple, high-level summary
    /// of where the Pod is in its lifecycle.
    pub phase: PodPhase,
    /// Date and time at which the object was acknowledged by the Kubelet.
    /// This is before the Kubelet pulled the container image(s) for the pod.
    pub start_time: Option<NaiveDateTime>,
    /// Current service state of pod.
    #[serde(default)]
    pub conditions: HashMap<PodConditionType, PodCondition>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Display)]
pub enum PodPhase {
    /// All containers in the pod have terminated,
    /// and at least one container has terminated in failure.
    Failed,
    /// The pod has been accepted by the system,
    /// but one or more of the containers has not been created.
    Pending,
    /// The pod has been bound to a node,
    /// and all of the containers have been created.
    Running,
    /// All containers in the pod have terminated in success,
    /// and will not be restarted.
    Succeeded,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone)]
pub enum PodConditionType {
    /// All containers in the pod are ready.
    ContainersReady,
    /// The pod has been scheduled to a node.
    PodScheduled,
    /// The pod is able to serve requests
    /// and should be added to the load balancing pools of all matching Services.
    Ready,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    pub status: bool,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<NaiveDateTime>,
}
