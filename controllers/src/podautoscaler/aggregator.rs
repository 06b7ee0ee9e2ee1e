use chrono::NaiveDateTime;
use resources::objects::{
    gpa::{
        ContainerResourceMetricSource, ExternalMetricSource, GeneralPodAutoscaler, MetricSpec,
        MetricStatus, MetricTarget, MetricValueStatus, ObjectMetricSource, PodsMetricSource,
        ResourceMetricSource,
    },
    scale::Scale,
    Labels, Object,
};

use crate::{
    error::{AggregationError, MetricError},
    replica_calculator::{Proposal, ReplicaCalculator, ScaleContext},
};

/// The winning proposal across all metric specs of an autoscaler.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub replicas: u32,
    /// Name of the metric that proposed `replicas`.
    pub metric: String,
    pub timestamp: NaiveDateTime,
    /// Statuses of every metric that could be computed.
    pub statuses: Vec<MetricStatus>,
}

pub struct MetricAggregator {
    calculator: ReplicaCalculator,
}

impl MetricAggregator {
    pub fn new(calculator: ReplicaCalculator) -> Self {
        Self {
            calculator,
        }
    }

    /// Compute a proposal per metric and pick the largest.
    /// Fails only when no metric could be computed at all.
    pub async fn compute_replicas_for_metrics(
        &self,
        gpa: &GeneralPodAutoscaler,
        scale: &Scale,
        metrics: &[MetricSpec],
        now: NaiveDateTime,
    ) -> Result<Aggregation, AggregationError> {
        if scale.selector.is_empty() {
            return Err(AggregationError::InvalidSelector(
                "selector is required".to_string(),
            ));
        }
        let selector: Labels = scale.selector.parse().map_err(|err| {
            AggregationError::InvalidSelector(format!(
                "couldn't convert selector into a corresponding internal selector object: {}",
                err
            ))
        })?;
        let ctx = ScaleContext {
            namespace: gpa.namespace(),
            selector: &selector,
            current_replicas: scale.spec_replicas,
            status_replicas: scale.status_replicas,
            now,
        };

        let mut winner: Option<(Proposal, String)> = None;
        let mut statuses = Vec::new();
        let mut invalid = 0;
        let mut first_error = None;
        for spec in metrics {
            match self.compute_replicas_for_metric(spec, &ctx).await {
                Ok((proposal, name, status)) => {
                    tracing::debug!(
                        "{} proposes {} replicas for {}",
                        name,
                        proposal.replicas,
                        gpa.key()
                    );
                    statuses.push(status);
                    if winner
                        .as_ref()
                        .map_or(true, |(best, _)| proposal.replicas > best.replicas)
                    {
                        winner = Some((proposal, name));
                    }
                },
                Err(err) => {
                    tracing::warn!("Invalid metric of {}: {}", gpa.key(), err);
                    invalid += 1;
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                },
            }
        }

        match (winner, first_error) {
            (Some((proposal, metric)), _) => Ok(Aggregation {
                replicas: proposal.replicas,
                metric,
                timestamp: proposal.timestamp,
                statuses,
            }),
            (None, Some(first)) => Err(AggregationError::InvalidMetrics {
                invalid,
                total: metrics.len(),
                first,
            }),
            (None, None) => Err(AggregationError::InvalidMetrics {
                invalid: 0,
                total: 0,
                first: MetricError::new("InvalidMetricSourceType", "no metrics configured"),
            }),
        }
    }

    async fn compute_replicas_for_metric(
        &self,
        spec: &MetricSpec,
        ctx: &ScaleContext<'_>,
    ) -> Result<(Proposal, String, MetricStatus), MetricError> {
        match spec {
            MetricSpec::Resource(source) => self.resource_replicas(source, ctx).await,
            MetricSpec::ContainerResource(source) => {
                self.container_resource_replicas(source, ctx).await
            },
            MetricSpec::Pods(source) => self.pods_replicas(source, ctx).await,
            MetricSpec::Object(source) => self.object_replicas(source, ctx).await,
            MetricSpec::External(source) => self.external_replicas(source, ctx).await,
            MetricSpec::Unknown => Err(MetricError::new(
                "InvalidMetricSourceType",
                "unknown metric source type",
            )),
        }
    }

    async fn resource_replicas(
        &self,
        source: &ResourceMetricSource,
        ctx: &ScaleContext<'_>,
    ) -> Result<(Proposal, String, MetricStatus), MetricError> {
        const REASON: &str = "FailedGetResourceMetric";
        let resource = source.name.to_string().to_lowercase();
        let (proposal, name) = match source.target {
            MetricTarget::AverageUtilization(target) => (
                self.calculator
                    .get_resource_replicas(ctx, source.name, None, target)
                    .await,
                format!("{} resource utilization (percentage of request)", resource),
            ),
            MetricTarget::AverageValue(target) => (
                self.calculator
                    .get_raw_resource_replicas(ctx, source.name, None, target)
                    .await,
                format!("{} resource", resource),
            ),
            MetricTarget::Value(_) => {
                return Err(MetricError::new(
                    REASON,
                    "invalid resource metric source: neither a utilization target nor a value target is set",
                ))
            },
        };
        let proposal = proposal
            .map_err(|err| MetricError::from_source(REASON, &format!("{} utilization", resource), err))?;
        let status = MetricStatus::Resource {
            name: source.name,
            current: average_status(&proposal),
        };
        Ok((proposal, name, status))
    }

    async fn container_resource_replicas(
        &self,
        source: &ContainerResourceMetricSource,
        ctx: &ScaleContext<'_>,
    ) -> Result<(Proposal, String, MetricStatus), MetricError> {
        const REASON: &str = "FailedGetContainerResourceMetric";
        let resource = source.name.to_string().to_lowercase();
        let container = Some(source.container.as_str());
        let (proposal, name) = match source.target {
            MetricTarget::AverageUtilization(target) => (
                self.calculator
                    .get_resource_replicas(ctx, source.name, container, target)
                    .await,
                format!(
                    "{} container resource utilization (percentage of request)",
                    resource
                ),
            ),
            MetricTarget::AverageValue(target) => (
                self.calculator
                    .get_raw_resource_replicas(ctx, source.name, container, target)
                    .await,
                format!("{} container resource", resource),
            ),
            MetricTarget::Value(_) => {
                return Err(MetricError::new(
                    REASON,
                    "invalid container resource metric source: neither a utilization target nor a value target is set",
                ))
            },
        };
        let proposal = proposal.map_err(|err| {
            MetricError::from_source(
                REASON,
                &format!("{} utilization of container {}", resource, source.container),
                err,
            )
        })?;
        let status = MetricStatus::ContainerResource {
            name: source.name,
            container: source.container.clone(),
            current: average_status(&proposal),
        };
        Ok((proposal, name, status))
    }

    async fn pods_replicas(
        &self,
        source: &PodsMetricSource,
        ctx: &ScaleContext<'_>,
    ) -> Result<(Proposal, String, MetricStatus), MetricError> {
        const REASON: &str = "FailedGetPodsMetric";
        let target = match source.target {
            MetricTarget::AverageValue(target) => target,
            _ => {
                return Err(MetricError::new(
                    REASON,
                    "invalid pods metric source: only an average value target is supported",
                ))
            },
        };
        let proposal = self
            .calculator
            .get_metric_replicas(ctx, &source.metric.name, &source.metric.selector, target)
            .await
            .map_err(|err| {
                MetricError::from_source(REASON, &format!("pods metric {}", source.metric.name), err)
            })?;
        let status = MetricStatus::Pods {
            metric: source.metric.clone(),
            current: MetricValueStatus {
                average_value: Some(proposal.usage),
                ..Default::default()
            },
        };
        Ok((proposal, format!("pods metric {}", source.metric.name), status))
    }

    async fn object_replicas(
        &self,
        source: &ObjectMetricSource,
        ctx: &ScaleContext<'_>,
    ) -> Result<(Proposal, String, MetricStatus), MetricError> {
        const REASON: &str = "FailedGetObjectMetric";
        let (proposal, per_pod) = match source.target {
            MetricTarget::Value(target) => {
                let proposal = self
                    .calculator
                    .get_object_metric_replicas(
                        ctx,
                        &source.metric.name,
                        &source.described_object,
                        &source.metric.selector,
                        target,
                    )
                    .await;
                (proposal, false)
            },
            MetricTarget::AverageValue(target) => {
                let proposal = self
                    .calculator
                    .get_object_per_pod_metric_replicas(
                        ctx,
                        &source.metric.name,
                        &source.described_object,
                        &source.metric.selector,
                        target,
                    )
                    .await;
                (proposal, true)
            },
            MetricTarget::AverageUtilization(_) => {
                return Err(MetricError::new(
                    REASON,
                    "invalid object metric source: neither a value target nor an average value target is set",
                ))
            },
        };
        let proposal = proposal.map_err(|err| {
            MetricError::from_source(
                REASON,
                &format!("object metric {} of {}", source.metric.name, source.described_object),
                err,
            )
        })?;
        let status = MetricStatus::Object {
            described_object: source.described_object.clone(),
            metric: source.metric.clone(),
            current: usage_status(proposal.usage, per_pod),
        };
        let name = format!("{} metric {}", source.described_object.kind, source.metric.name);
        Ok((proposal, name, status))
    }

    async fn external_replicas(
        &self,
        source: &ExternalMetricSource,
        ctx: &ScaleContext<'_>,
    ) -> Result<(Proposal, String, MetricStatus), MetricError> {
        const REASON: &str = "FailedGetExternalMetric";
        let (proposal, per_pod) = match source.target {
            MetricTarget::Value(target) => {
                let proposal = self
                    .calculator
                    .get_external_metric_replicas(
                        ctx,
                        &source.metric.name,
                        &source.metric.selector,
                        target,
                    )
                    .await;
                (proposal, false)
            },
            MetricTarget::AverageValue(target) => {
                let proposal = self
                    .calculator
                    .get_external_per_pod_metric_replicas(
                        ctx,
                        &source.metric.name,
                        &source.metric.selector,
                        target,
                    )
                    .await;
                (proposal, true)
            },
            MetricTarget::AverageUtilization(_) => {
                return Err(MetricError::new(
                    REASON,
                    "invalid external metric source: neither a value target nor an average value target is set",
                ))
            },
        };
        let proposal = proposal.map_err(|err| {
            MetricError::from_source(
                REASON,
                &format!("external metric {}", source.metric.name),
                err,
            )
        })?;
        let status = MetricStatus::External {
            metric: source.metric.clone(),
            current: usage_status(proposal.usage, per_pod),
        };
        let name = format!(
            "external metric {}({})",
            source.metric.name, source.metric.selector
        );
        Ok((proposal, name, status))
    }
}

fn usage_status(usage: i64, per_pod: bool) -> MetricValueStatus {
    if per_pod {
        MetricValueStatus {
            average_value: Some(usage),
            ..Default::default()
        }
    } else {
        MetricValueStatus {
            value: Some(usage),
            ..Default::default()
        }
    }
}

fn average_status(proposal: &Proposal) -> MetricValueStatus {
    MetricValueStatus {
        average_value: Some(proposal.usage),
        average_utilization: proposal.utilization,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use resources::objects::{
        gpa::{MetricIdentifier, PodsMetricSource},
        metrics::Resource,
    };

    use super::*;
    use crate::testing::{at, pod, FakeMetrics, FakePods, PodState};

    fn aggregator(metrics: FakeMetrics) -> MetricAggregator {
        let pods = vec![pod("p1", 1000, PodState::Ready), pod("p2", 1000, PodState::Ready)];
        MetricAggregator::new(ReplicaCalculator::new(
            Arc::new(metrics),
            Arc::new(FakePods::new(pods)),
            0.1,
            Duration::seconds(300),
            Duration::seconds(30),
        ))
    }

    fn autoscaler() -> GeneralPodAutoscaler {
        serde_yaml::from_str(
            "metadata:\n  name: web\nspec:\n  maxReplicas: 10\n  scaleTargetRef:\n    kind: Deployment\n    name: web\n",
        )
        .unwrap()
    }

    fn scale(selector: &str) -> Scale {
        Scale {
            spec_replicas: 2,
            status_replicas: 2,
            selector: selector.to_string(),
        }
    }

    fn pods_metric(name: &str) -> MetricSpec {
        MetricSpec::Pods(PodsMetricSource {
            metric: MetricIdentifier {
                name: name.to_string(),
                selector: Labels::new(),
            },
            target: MetricTarget::AverageValue(10_000),
        })
    }

    fn external_metric(name: &str) -> MetricSpec {
        MetricSpec::External(ExternalMetricSource {
            metric: MetricIdentifier {
                name: name.to_string(),
                selector: Labels::new(),
            },
            target: MetricTarget::Value(1_000),
        })
    }

    #[tokio::test]
    async fn largest_valid_proposal_wins() {
        let metrics = FakeMetrics::new()
            .with_raw("low", &[("p1", 25_000), ("p2", 25_000)])
            .with_raw("high", &[("p1", 40_000), ("p2", 40_000)])
            .with_raw("same", &[("p1", 40_000), ("p2", 40_000)]);
        let specs = [
            pods_metric("low"),
            pods_metric("high"),
            external_metric("missing"),
            pods_metric("same"),
        ];
        let aggregation = aggregator(metrics)
            .compute_replicas_for_metrics(&autoscaler(), &scale("app=web"), &specs, at(1000))
            .await
            .unwrap();
        assert_eq!(aggregation.replicas, 8);
        assert_eq!(aggregation.metric, "pods metric high");
        assert_eq!(aggregation.statuses.len(), 3);
        assert_eq!(
            aggregation.statuses[0],
            MetricStatus::Pods {
                metric: MetricIdentifier {
                    name: "low".to_string(),
                    selector: Labels::new(),
                },
                current: MetricValueStatus {
                    average_value: Some(25_000),
                    ..Default::default()
                },
            }
        );
    }

    #[tokio::test]
    async fn all_invalid_reports_first() {
        let specs = [
            MetricSpec::Unknown,
            MetricSpec::Resource(ResourceMetricSource {
                name: Resource::CPU,
                target: MetricTarget::Value(100),
            }),
        ];
        let err = aggregator(FakeMetrics::new())
            .compute_replicas_for_metrics(&autoscaler(), &scale("app=web"), &specs, at(1000))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "InvalidMetricSourceType");
        assert_eq!(
            err.to_string(),
            "invalid metrics (2 invalid out of 2), first error is: unknown metric source type"
        );
    }

    #[tokio::test]
    async fn fetch_failure_reason() {
        let err = aggregator(FakeMetrics::new())
            .compute_replicas_for_metrics(
                &autoscaler(),
                &scale("app=web"),
                &[external_metric("missing")],
                at(1000),
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "FailedGetExternalMetric");
        assert!(err.to_string().contains("unknown metric missing"));
    }

    #[tokio::test]
    async fn selector_is_required() {
        let aggregator = aggregator(FakeMetrics::new());
        let err = aggregator
            .compute_replicas_for_metrics(&autoscaler(), &scale(""), &[pods_metric("low")], at(0))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "InvalidSelector");
        assert_eq!(err.to_string(), "selector is required");

        let err = aggregator
            .compute_replicas_for_metrics(&autoscaler(), &scale("app!=web"), &[pods_metric("low")], at(0))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "InvalidSelector");
    }

    #[tokio::test]
    async fn resource_utilization_status() {
        let metrics = FakeMetrics::new().with_resource(&[("p1", 800), ("p2", 800)]);
        let specs = [MetricSpec::Resource(ResourceMetricSource {
            name: Resource::CPU,
            target: MetricTarget::AverageUtilization(50),
        })];
        let aggregation = aggregator(metrics)
            .compute_replicas_for_metrics(&autoscaler(), &scale("app=web"), &specs, at(1000))
            .await
            .unwrap();
        assert_eq!(aggregation.replicas, 4);
        assert_eq!(
            aggregation.metric,
            "cpu resource utilization (percentage of request)"
        );
        assert_eq!(aggregation.statuses, vec![MetricStatus::Resource {
            name: Resource::CPU,
            current: MetricValueStatus {
                average_value: Some(800),
                average_utilization: Some(80),
                value: None,
            },
        }]);
    }
}
