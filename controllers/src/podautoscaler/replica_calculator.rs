use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime};
use resources::objects::{
    metrics::{PodMetric, PodMetricsInfo, Resource},
    object_reference::ObjectReference,
    pod::{Pod, PodConditionType, PodPhase},
    Labels,
};

use crate::{metrics::MetricsSource, utils::PodLister};

/// The scale target as seen by one reconcile.
#[derive(Debug, Clone, Copy)]
pub struct ScaleContext<'a> {
    pub namespace: &'a str,
    pub selector: &'a Labels,
    pub current_replicas: u32,
    pub status_replicas: u32,
    pub now: NaiveDateTime,
}

/// Replica count proposed by one metric, with the values it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub replicas: u32,
    /// Average per pod, or the total for whole-object metrics.
    pub usage: i64,
    /// Percentage of the requests, for utilization targets only.
    pub utilization: Option<u32>,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Default)]
struct PodGroups {
    ready_count: usize,
    unready: HashSet<String>,
    missing: HashSet<String>,
    ignored: HashSet<String>,
}

pub struct ReplicaCalculator {
    metrics: Arc<dyn MetricsSource>,
    pods: Arc<dyn PodLister>,
    tolerance: f64,
    cpu_initialization_period: Duration,
    delay_of_initial_readiness_status: Duration,
}

impl ReplicaCalculator {
    pub fn new(
        metrics: Arc<dyn MetricsSource>,
        pods: Arc<dyn PodLister>,
        tolerance: f64,
        cpu_initialization_period: Duration,
        delay_of_initial_readiness_status: Duration,
    ) -> Self {
        Self {
            metrics,
            pods,
            tolerance,
            cpu_initialization_period,
            delay_of_initial_readiness_status,
        }
    }

    fn within_tolerance(&self, ratio: f64) -> bool {
        (1.0 - ratio).abs() <= self.tolerance
    }

    /// Calculate desired replica count based on target utilization
    pub async fn get_resource_replicas(
        &self,
        ctx: &ScaleContext<'_>,
        resource: Resource,
        container: Option<&str>,
        target_utilization: u32,
    ) -> Result<Proposal> {
        let (mut metrics, timestamp) = self
            .metrics
            .get_resource_metric(resource, ctx.namespace, ctx.selector, container)
            .await?;
        let pods = self.list_pods(ctx).await?;
        let groups = self.group_pods(&pods, &metrics, Some(resource), ctx.now);
        remove_metrics_for_pods(&mut metrics, &groups.ignored);
        remove_metrics_for_pods(&mut metrics, &groups.unready);
        if metrics.is_empty() {
            return Err(anyhow!("did not receive metrics for any ready pods"));
        }

        let requests = pods
            .iter()
            .filter(|pod| !groups.ignored.contains(&pod.metadata.name))
            .map(|pod| Ok((pod.metadata.name.clone(), pod.requests(&resource, container)?)))
            .collect::<Result<std::collections::HashMap<_, _>>>()?;
        let (usage_ratio, utilization, raw_utilization) =
            utilization_ratio(&metrics, &requests, target_utilization)?;
        tracing::debug!(
            "Utilization of {} is {}% against target {}%",
            resource,
            utilization,
            target_utilization
        );
        let proposal = |replicas| Proposal {
            replicas,
            usage: raw_utilization,
            utilization: Some(utilization),
            timestamp,
        };

        let scale_up_with_unready = !groups.unready.is_empty() && usage_ratio > 1.0;
        if !scale_up_with_unready && groups.missing.is_empty() {
            if self.within_tolerance(usage_ratio) {
                return Ok(proposal(ctx.current_replicas));
            }
            return Ok(proposal(
                (usage_ratio * groups.ready_count as f64).ceil() as u32,
            ));
        }

        // Conservative assumptions about pods we know nothing about
        if usage_ratio < 1.0 {
            let fallback = 100u32.max(target_utilization) as i64;
            for name in &groups.missing {
                let request = requests.get(name).copied().unwrap_or_default();
                metrics.insert(name.clone(), zero_sample(request * fallback / 100, ctx.now));
            }
        } else if usage_ratio > 1.0 {
            for name in &groups.missing {
                metrics.insert(name.clone(), zero_sample(0, ctx.now));
            }
        }
        if scale_up_with_unready {
            for name in &groups.unready {
                metrics.insert(name.clone(), zero_sample(0, ctx.now));
            }
        }

        let (new_usage_ratio, _, _) = utilization_ratio(&metrics, &requests, target_utilization)?;
        Ok(proposal(self.rebalanced_replicas(
            ctx.current_replicas,
            usage_ratio,
            new_usage_ratio,
            metrics.len(),
        )))
    }

    /// Calculate desired replica count based on the raw value of a resource
    pub async fn get_raw_resource_replicas(
        &self,
        ctx: &ScaleContext<'_>,
        resource: Resource,
        container: Option<&str>,
        target_usage: i64,
    ) -> Result<Proposal> {
        let (metrics, timestamp) = self
            .metrics
            .get_resource_metric(resource, ctx.namespace, ctx.selector, container)
            .await?;
        self.plain_metric_replicas(ctx, metrics, timestamp, target_usage, Some(resource))
            .await
    }

    /// Calculate desired replica count based on a custom metric of every pod
    pub async fn get_metric_replicas(
        &self,
        ctx: &ScaleContext<'_>,
        metric: &str,
        metric_selector: &Labels,
        target_usage: i64,
    ) -> Result<Proposal> {
        let (metrics, timestamp) = self
            .metrics
            .get_raw_metric(metric, ctx.namespace, ctx.selector, metric_selector)
            .await?;
        self.plain_metric_replicas(ctx, metrics, timestamp, target_usage, None)
            .await
    }

    async fn plain_metric_replicas(
        &self,
        ctx: &ScaleContext<'_>,
        mut metrics: PodMetricsInfo,
        timestamp: NaiveDateTime,
        target_usage: i64,
        resource: Option<Resource>,
    ) -> Result<Proposal> {
        let pods = self.list_pods(ctx).await?;
        let groups = self.group_pods(&pods, &metrics, resource, ctx.now);
        remove_metrics_for_pods(&mut metrics, &groups.ignored);
        remove_metrics_for_pods(&mut metrics, &groups.unready);
        if metrics.is_empty() {
            return Err(anyhow!("did not receive metrics for any ready pods"));
        }

        let (usage_ratio, usage) = average_ratio(&metrics, target_usage)?;
        let proposal = |replicas| Proposal {
            replicas,
            usage,
            utilization: None,
            timestamp,
        };

        let scale_up_with_unready = !groups.unready.is_empty() && usage_ratio > 1.0;
        if !scale_up_with_unready && groups.missing.is_empty() {
            if self.within_tolerance(usage_ratio) {
                return Ok(proposal(ctx.current_replicas));
            }
            return Ok(proposal(
                (usage_ratio * groups.ready_count as f64).ceil() as u32,
            ));
        }

        if !groups.missing.is_empty() {
            let assumed = if usage_ratio < 1.0 { target_usage } else { 0 };
            for name in &groups.missing {
                metrics.insert(name.clone(), zero_sample(assumed, ctx.now));
            }
        }
        if scale_up_with_unready {
            for name in &groups.unready {
                metrics.insert(name.clone(), zero_sample(0, ctx.now));
            }
        }

        let (new_usage_ratio, _) = average_ratio(&metrics, target_usage)?;
        Ok(proposal(self.rebalanced_replicas(
            ctx.current_replicas,
            usage_ratio,
            new_usage_ratio,
            metrics.len(),
        )))
    }

    /// Keep the current count when the assumptions flip the direction,
    /// or when the result is within tolerance.
    fn rebalanced_replicas(
        &self,
        current_replicas: u32,
        usage_ratio: f64,
        new_usage_ratio: f64,
        samples: usize,
    ) -> u32 {
        if self.within_tolerance(new_usage_ratio)
            || (usage_ratio < 1.0 && new_usage_ratio > 1.0)
            || (usage_ratio > 1.0 && new_usage_ratio < 1.0)
        {
            return current_replicas;
        }
        let new_replicas = (new_usage_ratio * samples as f64).ceil() as u32;
        if (new_usage_ratio < 1.0 && new_replicas > current_replicas)
            || (new_usage_ratio > 1.0 && new_replicas < current_replicas)
        {
            return current_replicas;
        }
        new_replicas
    }

    /// Calculate desired replica count based on the value of a single object
    pub async fn get_object_metric_replicas(
        &self,
        ctx: &ScaleContext<'_>,
        metric: &str,
        object: &ObjectReference,
        metric_selector: &Labels,
        target_usage: i64,
    ) -> Result<Proposal> {
        let (usage, timestamp) = self
            .metrics
            .get_object_metric(metric, ctx.namespace, object, metric_selector)
            .await?;
        let usage_ratio = usage as f64 / target_usage as f64;
        let replicas = self.usage_ratio_replica_count(ctx, usage_ratio).await?;
        Ok(Proposal {
            replicas,
            usage,
            utilization: None,
            timestamp,
        })
    }

    /// Calculate desired replica count based on the value of a single object,
    /// targeted as an average over the pods
    pub async fn get_object_per_pod_metric_replicas(
        &self,
        ctx: &ScaleContext<'_>,
        metric: &str,
        object: &ObjectReference,
        metric_selector: &Labels,
        target_average_usage: i64,
    ) -> Result<Proposal> {
        let (usage, timestamp) = self
            .metrics
            .get_object_metric(metric, ctx.namespace, object, metric_selector)
            .await?;
        let replicas = self.per_pod_replica_count(ctx.status_replicas, usage, target_average_usage);
        Ok(Proposal {
            replicas,
            usage: average_usage(usage, ctx.status_replicas),
            utilization: None,
            timestamp,
        })
    }

    /// Calculate desired replica count based on the sum of an external metric
    pub async fn get_external_metric_replicas(
        &self,
        ctx: &ScaleContext<'_>,
        metric: &str,
        metric_selector: &Labels,
        target_usage: i64,
    ) -> Result<Proposal> {
        let (values, timestamp) = self
            .metrics
            .get_external_metric(metric, ctx.namespace, metric_selector)
            .await?;
        let usage: i64 = values.iter().sum();
        let usage_ratio = usage as f64 / target_usage as f64;
        let replicas = self.usage_ratio_replica_count(ctx, usage_ratio).await?;
        Ok(Proposal {
            replicas,
            usage,
            utilization: None,
            timestamp,
        })
    }

    /// Calculate desired replica count based on the sum of an external metric,
    /// targeted as an average over the pods
    pub async fn get_external_per_pod_metric_replicas(
        &self,
        ctx: &ScaleContext<'_>,
        metric: &str,
        metric_selector: &Labels,
        target_average_usage: i64,
    ) -> Result<Proposal> {
        let (values, timestamp) = self
            .metrics
            .get_external_metric(metric, ctx.namespace, metric_selector)
            .await?;
        let usage: i64 = values.iter().sum();
        let replicas = self.per_pod_replica_count(ctx.status_replicas, usage, target_average_usage);
        Ok(Proposal {
            replicas,
            usage: average_usage(usage, ctx.status_replicas),
            utilization: None,
            timestamp,
        })
    }

    fn per_pod_replica_count(&self, status_replicas: u32, usage: i64, target: i64) -> u32 {
        let usage_ratio = usage as f64 / (target as f64 * status_replicas as f64);
        if self.within_tolerance(usage_ratio) {
            status_replicas
        } else {
            (usage as f64 / target as f64).ceil() as u32
        }
    }

    async fn usage_ratio_replica_count(&self, ctx: &ScaleContext<'_>, usage_ratio: f64) -> Result<u32> {
        if ctx.current_replicas == 0 {
            return Ok(usage_ratio.ceil() as u32);
        }
        if self.within_tolerance(usage_ratio) {
            return Ok(ctx.current_replicas);
        }
        let ready = self.ready_pods_count(ctx).await?;
        Ok((usage_ratio * ready as f64).ceil() as u32)
    }

    async fn ready_pods_count(&self, ctx: &ScaleContext<'_>) -> Result<usize> {
        let pods = self.list_pods(ctx).await?;
        Ok(pods
            .iter()
            .filter(|pod| pod.phase() == PodPhase::Running && pod.is_ready())
            .count())
    }

    async fn list_pods(&self, ctx: &ScaleContext<'_>) -> Result<Vec<Pod>> {
        let pods = self.pods.list_pods(ctx.namespace, ctx.selector).await?;
        if pods.is_empty() {
            return Err(anyhow!(
                "no pods returned by selector while calculating replica count"
            ));
        }
        Ok(pods)
    }

    /// Sort pods into ready, unready, missing (no sample) and ignored.
    /// CPU samples of pods that only just started are not trusted.
    fn group_pods(
        &self,
        pods: &[Pod],
        metrics: &PodMetricsInfo,
        resource: Option<Resource>,
        now: NaiveDateTime,
    ) -> PodGroups {
        let mut groups = PodGroups::default();
        for pod in pods {
            let name = &pod.metadata.name;
            let phase = pod.phase();
            if pod.metadata.deletion_timestamp.is_some() || phase == PodPhase::Failed {
                groups.ignored.insert(name.clone());
                continue;
            }
            if phase == PodPhase::Pending {
                groups.unready.insert(name.clone());
                continue;
            }
            let metric = match metrics.get(name) {
                Some(metric) => metric,
                None => {
                    groups.missing.insert(name.clone());
                    continue;
                },
            };
            if resource == Some(Resource::CPU) && self.cpu_sample_unready(pod, metric, now) {
                groups.unready.insert(name.clone());
                continue;
            }
            groups.ready_count += 1;
        }
        groups
    }

    fn cpu_sample_unready(&self, pod: &Pod, metric: &PodMetric, now: NaiveDateTime) -> bool {
        let condition = pod.condition(&PodConditionType::Ready);
        let start_time = pod.status.as_ref().and_then(|status| status.start_time);
        let (condition, start_time) = match (condition, start_time) {
            (Some(condition), Some(start_time)) => (condition, start_time),
            _ => return true,
        };
        let transition = condition.last_transition_time.unwrap_or(start_time);
        if start_time + self.cpu_initialization_period > now {
            // Still initializing: the sample must cover a whole window since the last transition
            !condition.status
                || metric.timestamp < transition + Duration::seconds(metric.window.into())
        } else {
            // Never been ready
            !condition.status && start_time + self.delay_of_initial_readiness_status > transition
        }
    }
}

fn remove_metrics_for_pods(metrics: &mut PodMetricsInfo, pods: &HashSet<String>) {
    for pod in pods {
        metrics.remove(pod);
    }
}

fn zero_sample(value: i64, now: NaiveDateTime) -> PodMetric {
    PodMetric {
        timestamp: now,
        window: 0,
        value,
    }
}

/// Returns the usage ratio, the utilization in percent and the average raw usage.
fn utilization_ratio(
    metrics: &PodMetricsInfo,
    requests: &std::collections::HashMap<String, i64>,
    target_utilization: u32,
) -> Result<(f64, u32, i64)> {
    let mut metrics_total = 0;
    let mut requests_total = 0;
    let mut entries = 0;
    for (name, metric) in metrics {
        if let Some(request) = requests.get(name) {
            metrics_total += metric.value;
            requests_total += request;
            entries += 1;
        }
    }
    if requests_total == 0 {
        return Err(anyhow!("no metrics returned matched known pods"));
    }
    let utilization = (metrics_total * 100 / requests_total) as u32;
    Ok((
        utilization as f64 / target_utilization as f64,
        utilization,
        metrics_total / entries,
    ))
}

/// Returns the usage ratio and the average usage.
fn average_ratio(metrics: &PodMetricsInfo, target_usage: i64) -> Result<(f64, i64)> {
    if metrics.is_empty() {
        return Err(anyhow!("no metrics to average"));
    }
    let total: i64 = metrics.values().map(|metric| metric.value).sum();
    let usage = total / metrics.len() as i64;
    Ok((usage as f64 / target_usage as f64, usage))
}

fn average_usage(usage: i64, replicas: u32) -> i64 {
    if replicas == 0 {
        usage
    } else {
        (usage as f64 / replicas as f64).ceil() as i64
    }
}
