use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Kind of the referent.
    pub kind: String,
    /// Name of the referent.
    pub name: String,
    /// API version of the referent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl ObjectReference {
    pub fn new(kind: String, name: String) -> ObjectReference {
        ObjectReference {
            kind,
            name,
            api_version: None,
        }
    }

    /// Resource path segment of a scalable kind, e.g. `replicasets`.
    pub fn scalable_resource(&self) -> Result<&'static str> {
        match self.kind.as_str() {
            "Deployment" => Ok("deployments"),
            "ReplicaSet" => Ok("replicasets"),
            "StatefulSet" => Ok("statefulsets"),
            "ReplicationController" => Ok("replicationcontrollers"),
            kind => Err(anyhow!("unable to determine resource for scale target kind {}", kind)),
        }
    }

    /// Plural resource path segment of any kind, e.g. `services`.
    pub fn resource(&self) -> String {
        self.scalable_resource()
            .map(str::to_string)
            .unwrap_or_else(|_| format!("{}s", self.kind.to_lowercase()))
    }
}

impl std::fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}
