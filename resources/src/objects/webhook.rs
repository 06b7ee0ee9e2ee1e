use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Body exchanged with a scaling webhook.
/// The controller sends `request`, the webhook answers with `response`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ScaleReview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ScaleRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ScaleResponse>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRequest {
    /// Identifier of this round trip, echoed back in the response.
    pub uid: String,
    /// Name of the scale target.
    pub name: String,
    pub namespace: String,
    /// Parameters configured on the autoscaler, passed through verbatim.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub current_replicas: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleResponse {
    pub uid: String,
    /// Whether the webhook asks for a change at all.
    pub scale: bool,
    /// Requested replica count, only meaningful when `scale` is set.
    #[serde(default)]
    pub replicas: u32,
}
