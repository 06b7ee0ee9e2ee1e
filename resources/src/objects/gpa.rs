use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::{
    labels::Labels, metrics::Resource, object_reference::ObjectReference, Metadata, Object,
};

/// GeneralPodAutoscaler scales a workload on metrics, time ranges and webhooks.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GeneralPodAutoscaler {
    pub metadata: Metadata,
    pub spec: GeneralPodAutoscalerSpec,
    #[serde(default)]
    pub status: Option<GeneralPodAutoscalerStatus>,
}

impl Object for GeneralPodAutoscaler {
    fn kind(&self) -> &'static str {
        "GeneralPodAutoscaler"
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneralPodAutoscalerSpec {
    /// The upper limit for the number of replicas
    /// to which the autoscaler can scale up.
    /// It cannot be less that minReplicas.
    pub max_replicas: u32,
    /// The lower limit for the number of replicas
    /// to which the autoscaler can scale down.
    /// It defaults to 1 pod.
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,
    /// Points to the target resource to scale,
    /// and is used to the pods for which metrics should be collected,
    /// as well as to actually change the replica count.
    pub scale_target_ref: ObjectReference,
    /// Signal sources driving this autoscaler.
    #[serde(flatten)]
    pub driven_mode: DrivenMode,
    /// Configures the scaling behavior of the target
    /// in both Up and Down directions
    /// (scaleUp and scaleDown fields respectively).
    /// If not set, a fixed stabilization window and
    /// a fixed scale up limit are used instead.
    #[serde(default)]
    pub behavior: Option<GeneralPodAutoscalerBehavior>,
}

fn default_min_replicas() -> u32 {
    1
}

/// Union of the signal sources of an autoscaler. At least one is set.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DrivenMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<MetricMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventMode>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricMode {
    /// Contains the specifications for which to use
    /// to calculate the desired replica count
    /// (the maximum replica count across all metrics will be used).
    /// The desired replica count is calculated multiplying the ratio
    /// between the target value and the current value
    /// by the current number of pods.
    /// Ergo, metrics used must decrease as the pod count is increased, and vice-versa.
    pub metrics: Vec<MetricSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimeMode {
    pub ranges: Vec<TimeRange>,
}

/// A cron schedule during whose firings the target runs `desired_replicas`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// Standard 5-field cron expression, `min hour dom month dow`.
    pub schedule: String,
    pub desired_replicas: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMode {
    /// How to reach the webhook.
    pub client_config: WebhookClientConfig,
    /// Passed to the webhook with every request.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebhookClientConfig {
    /// Location of the webhook, in standard URL form.
    /// Exactly one of `url` or `service` must be specified.
    #[serde(default)]
    pub url: Option<String>,
    /// Reference to the service for this webhook.
    #[serde(default)]
    pub service: Option<ServiceReference>,
    /// PEM encoded CA bundle used to validate the webhook's server certificate.
    /// When set, service references are reached over https.
    #[serde(default)]
    pub ca_bundle: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    /// Namespace of the service. Defaults to "default".
    #[serde(default = "default_service_namespace")]
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// URL path which will be sent in any request to this service.
    #[serde(default)]
    pub path: Option<String>,
    /// Port on the service hosting the webhook. Defaults to 8000.
    #[serde(default = "default_service_port")]
    pub port: u16,
}

fn default_service_namespace() -> String {
    "default".to_string()
}

fn default_service_port() -> u16 {
    8000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventMode {
    pub triggers: Vec<ScaleTrigger>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTrigger {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// GeneralPodAutoscalerBehavior configures the scaling behavior
/// of the target in both Up and Down directions
/// (scaleUp and scaleDown fields respectively).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeneralPodAutoscalerBehavior {
    /// Scaling policy for scaling Up.
    /// If not set, the default value is the higher of:
    /// - increase no more than 4 pods per 15 seconds
    /// - double the number of pods per 15 seconds
    /// No stabilization is used.
    #[serde(default)]
    pub scale_up: Option<ScalingRules>,
    /// Scaling policy for scaling Down.
    /// If not set, the default value is to allow to scale down
    /// to minReplicas pods, with the controller's downscale stabilization
    /// window (i.e., the highest recommendation within it is used).
    #[serde(default)]
    pub scale_down: Option<ScalingRules>,
}

impl GeneralPodAutoscalerBehavior {
    /// Scale up rules with every unset field defaulted.
    pub fn scale_up_rules(&self) -> ScalingRules {
        let defaults = ScalingRules {
            stabilization_window_seconds: Some(0),
            select_policy: PolicySelection::Max,
            policies: vec![
                ScalingPolicy {
                    type_: ScalingPolicyType::Pods,
                    value: 4,
                    period_seconds: 15,
                },
                ScalingPolicy {
                    type_: ScalingPolicyType::Percent,
                    value: 100,
                    period_seconds: 15,
                },
            ],
        };
        resolve_rules(self.scale_up.as_ref(), defaults)
    }

    /// Scale down rules with every unset field defaulted.
    /// `default_window` is the controller's downscale stabilization window.
    pub fn scale_down_rules(&self, default_window: u32) -> ScalingRules {
        let defaults = ScalingRules {
            stabilization_window_seconds: Some(default_window),
            select_policy: PolicySelection::Max,
            policies: vec![ScalingPolicy {
                type_: ScalingPolicyType::Percent,
                value: 100,
                period_seconds: 15,
            }],
        };
        resolve_rules(self.scale_down.as_ref(), defaults)
    }
}

fn resolve_rules(rules: Option<&ScalingRules>, defaults: ScalingRules) -> ScalingRules {
    match rules {
        None => defaults,
        Some(rules) => ScalingRules {
            stabilization_window_seconds: rules
                .stabilization_window_seconds
                .or(defaults.stabilization_window_seconds),
            select_policy: rules.select_policy.clone(),
            policies: if rules.policies.is_empty() {
                defaults.policies
            } else {
                rules.policies.clone()
            },
        },
    }
}

/// ScalingRules configures the scaling behavior for one direction.
/// These Rules are applied after calculating DesiredReplicas
/// from metrics for the GPA.
/// They can limit the scaling velocity by specifying scaling policies.
/// They can prevent flapping by specifying the stabilization window,
/// so that the number of replicas is not set instantly,
/// instead, the safest value from the stabilization window is chosen.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingRules {
    /// Number of seconds for which past recommendations should be considered
    /// while scaling up or scaling down.
    /// Must be greater than or equal to zero and less than or equal to 3600 (one hour).
    /// If not set, use the default values:
    /// - For scale up: 0 (i.e. no stabilization is done).
    /// - For scale down: the controller's downscale stabilization window.
    #[serde(default)]
    pub stabilization_window_seconds: Option<u32>,
    /// Specify which policy should be used.
    /// If not set, the default value Max is used.
    #[serde(default)]
    pub select_policy: PolicySelection,
    /// A list of potential scaling polices which can be used during scaling.
    #[serde(default)]
    pub policies: Vec<ScalingPolicy>,
}

impl ScalingRules {
    pub fn stabilization_window(&self) -> u32 {
        self.stabilization_window_seconds.unwrap_or(0)
    }

    pub fn longest_period(&self) -> u32 {
        self.policies
            .iter()
            .map(|policy| policy.period_seconds)
            .max()
            .unwrap_or(0)
    }
}

/// PolicySelection describes how to choose a policy from multiple ones
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub enum PolicySelection {
    /// Select the policy with the lowest recommendation value.
    Min,
    /// Select the policy with the highest recommendation value.
    #[default]
    Max,
    /// Disable current action
    Disabled,
}

/// ScalingPolicy is a single policy
/// which must hold true for a specified past interval.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicy {
    /// Specify the scaling policy.
    #[serde(rename = "type")]
    pub type_: ScalingPolicyType,
    /// Contains the amount of change which is permitted by the policy.
    /// It must be greater than zero.
    pub value: u32,
    /// Specifies the window of time for which the policy should hold true.
    /// PeriodSeconds must be greater than zero
    /// and less than or equal to 1800(30 min).
    pub period_seconds: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ScalingPolicyType {
    Pods,
    Percent,
}

/// Identifies a custom or external metric.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricIdentifier {
    /// Name of the given metric.
    pub name: String,
    /// Label selector further scoping the metric.
    #[serde(default)]
    pub selector: Labels,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MetricSpec {
    /// A metric describing a single object (for example, hits-per-second on an Ingress).
    Object(ObjectMetricSource),
    /// A metric describing each pod in the current scale target,
    /// averaged together before being compared to the target value.
    Pods(PodsMetricSource),
    /// A resource metric known to the system (e.g. CPU or memory)
    /// as specified in requests and limits.
    Resource(ResourceMetricSource),
    /// A resource metric of a single container in each pod.
    ContainerResource(ContainerResourceMetricSource),
    /// A global metric not associated with any object.
    External(ExternalMetricSource),
    /// A metric source type this controller does not know.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetricSource {
    pub described_object: ObjectReference,
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodsMetricSource {
    pub metric: MetricIdentifier,
    /// Only AverageValue is supported for pods metrics.
    pub target: MetricTarget,
}

/// ResourceMetricSource indicates how to scale on a resource metric
/// known to the system, as specified in requests and limits,
/// describing each pod in the current scale target (e.g. CPU or memory).
/// The values will be averaged together before being compared to the target.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceMetricSource {
    /// Name of the resource.
    pub name: Resource,
    /// Target value for the given metric
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerResourceMetricSource {
    /// Name of the resource.
    pub name: Resource,
    /// Name of the container in the pods of the scaling target.
    pub container: String,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExternalMetricSource {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

/// MetricTarget defines the target value, average value,
/// or average utilization of a specific metric.
/// Values are in milli-units.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum MetricTarget {
    /// Target value of the metric.
    Value(i64),
    /// Target value of the average of the metric
    /// across all relevant pods.
    AverageValue(i64),
    /// Target value of the average of the resource metric
    /// across all relevant pods,
    /// represented as a percentage of the requested value
    /// of the resource for the pods.
    AverageUtilization(u32),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeneralPodAutoscalerStatus {
    /// Current number of replicas of pods managed by this autoscaler,
    /// as last seen by the autoscaler.
    pub current_replicas: u32,
    /// Desired number of replicas of pods managed by this autoscaler,
    /// as last calculated by the autoscaler.
    pub desired_replicas: u32,
    /// Last time the GeneralPodAutoscaler scaled the number of pods,
    /// used by the autoscaler to control how often the number of pods is changed.
    pub last_scale_time: Option<NaiveDateTime>,
    /// Last read state of the metrics used by this autoscaler.
    #[serde(default)]
    pub current_metrics: Vec<MetricStatus>,
    /// Conditions required for this autoscaler to scale its target,
    /// and whether or not those conditions are met.
    #[serde(default)]
    pub conditions: Vec<GeneralPodAutoscalerCondition>,
}

impl GeneralPodAutoscalerStatus {
    /// Set a condition, replacing any condition of the same type.
    /// The transition time only moves when the status changes.
    pub fn set_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        now: NaiveDateTime,
    ) {
        let message = message.into();
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(condition) => {
                if condition.status != status {
                    condition.last_transition_time = now;
                }
                condition.status = status;
                condition.reason = reason.to_string();
                condition.message = message;
            },
            None => self.conditions.push(GeneralPodAutoscalerCondition {
                type_,
                status,
                reason: reason.to_string(),
                message,
                last_transition_time: now,
            }),
        }
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&GeneralPodAutoscalerCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneralPodAutoscalerCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    /// Machine readable reason for the last transition.
    pub reason: String,
    /// Human readable explanation of the last transition.
    pub message: String,
    pub last_transition_time: NaiveDateTime,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConditionType {
    /// Whether the autoscaler is able to fetch and update scales,
    /// and whether backoff-related conditions are preventing scaling.
    AbleToScale,
    /// Whether the autoscaler is able to compute a replica count.
    ScalingActive,
    /// Whether the desired scale was capped by the bounds or rate limits.
    ScalingLimited,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Current value of a metric, mirroring the targets of MetricTarget.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricValueStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MetricStatus {
    Object {
        #[serde(rename = "describedObject")]
        described_object: ObjectReference,
        metric: MetricIdentifier,
        current: MetricValueStatus,
    },
    Pods {
        metric: MetricIdentifier,
        current: MetricValueStatus,
    },
    Resource {
        name: Resource,
        current: MetricValueStatus,
    },
    ContainerResource {
        name: Resource,
        container: String,
        current: MetricValueStatus,
    },
    External {
        metric: MetricIdentifier,
        current: MetricValueStatus,
    },
}
