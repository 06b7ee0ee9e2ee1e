use serde::{Deserialize, Serialize};

/// Scale subresource of a scalable workload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Scale {
    /// Desired number of instances for the scaled object.
    pub spec_replicas: u32,
    /// Actual number of observed instances of the scaled object.
    pub status_replicas: u32,
    /// Label query over pods that should match the replicas count,
    /// in the string form `k1=v1,k2=v2`.
    #[serde(default)]
    pub selector: String,
}
