use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use resources::objects::{
    metrics::{MetricValue, PodMetric, PodMetrics, PodMetricsInfo, Resource},
    object_reference::ObjectReference,
    Labels,
};

use crate::utils::RestClient;

/// Where the autoscaler reads metric samples from.
/// Every call returns the samples and the time they were taken.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Usage of `resource` per pod, or of the single `container` in each pod.
    async fn get_resource_metric(
        &self,
        resource: Resource,
        namespace: &str,
        selector: &Labels,
        container: Option<&str>,
    ) -> Result<(PodMetricsInfo, NaiveDateTime)>;

    /// A custom metric per pod.
    async fn get_raw_metric(
        &self,
        metric: &str,
        namespace: &str,
        selector: &Labels,
        metric_selector: &Labels,
    ) -> Result<(PodMetricsInfo, NaiveDateTime)>;

    /// A custom metric describing a single object.
    async fn get_object_metric(
        &self,
        metric: &str,
        namespace: &str,
        object: &ObjectReference,
        metric_selector: &Labels,
    ) -> Result<(i64, NaiveDateTime)>;

    /// All samples of an external metric.
    async fn get_external_metric(
        &self,
        metric: &str,
        namespace: &str,
        metric_selector: &Labels,
    ) -> Result<(Vec<i64>, NaiveDateTime)>;
}

/// Sum the usage of `resource` per pod. Pods lacking a sample for any
/// relevant container are left out.
fn resource_usage(
    metrics: Vec<PodMetrics>,
    resource: Resource,
    container: Option<&str>,
) -> Result<(PodMetricsInfo, NaiveDateTime)> {
    let timestamp = metrics
        .first()
        .map(|pod| pod.timestamp)
        .ok_or_else(|| anyhow!("no metrics returned from resource metrics API"))?;
    let mut metric_info = PodMetricsInfo::new();
    'pods: for pod in metrics {
        let mut sum = 0;
        let mut found = false;
        for c in &pod.containers {
            if container.map_or(false, |name| name != c.name) {
                continue;
            }
            match c.usage.get(&resource) {
                Some(usage) => {
                    sum += *usage;
                    found = true;
                },
                None => {
                    tracing::debug!(
                        "Missing resource metric {} for container {} in pod {}",
                        resource,
                        c.name,
                        pod.name
                    );
                    continue 'pods;
                },
            }
        }
        if found {
            metric_info.insert(pod.name, PodMetric {
                timestamp: pod.timestamp,
                window: pod.window,
                value: sum,
            });
        }
    }
    Ok((metric_info, timestamp))
}

fn per_pod(values: Vec<MetricValue>, metric: &str) -> Result<(PodMetricsInfo, NaiveDateTime)> {
    let timestamp = values
        .first()
        .map(|value| value.timestamp)
        .ok_or_else(|| anyhow!("no metrics returned for {} from custom metrics API", metric))?;
    let metric_info = values
        .into_iter()
        .filter_map(|value| {
            value.described_object.map(|pod| {
                (pod, PodMetric {
                    timestamp: value.timestamp,
                    window: value.window,
                    value: value.value,
                })
            })
        })
        .collect();
    Ok((metric_info, timestamp))
}

#[async_trait]
impl MetricsSource for RestClient {
    async fn get_resource_metric(
        &self,
        resource: Resource,
        namespace: &str,
        selector: &Labels,
        container: Option<&str>,
    ) -> Result<(PodMetricsInfo, NaiveDateTime)> {
        let metrics: Vec<PodMetrics> = self
            .get(
                &format!("/api/v1/metrics/namespaces/{}/pods", namespace),
                &[("selector", selector.to_string())],
            )
            .await?;
        resource_usage(metrics, resource, container)
    }

    async fn get_raw_metric(
        &self,
        metric: &str,
        namespace: &str,
        selector: &Labels,
        metric_selector: &Labels,
    ) -> Result<(PodMetricsInfo, NaiveDateTime)> {
        let values: Vec<MetricValue> = self
            .get(
                &format!("/apis/custom.metrics/namespaces/{}/pods/{}", namespace, metric),
                &[
                    ("selector", selector.to_string()),
                    ("metricSelector", metric_selector.to_string()),
                ],
            )
            .await?;
        per_pod(values, metric)
    }

    async fn get_object_metric(
        &self,
        metric: &str,
        namespace: &str,
        object: &ObjectReference,
        metric_selector: &Labels,
    ) -> Result<(i64, NaiveDateTime)> {
        let value: MetricValue = self
            .get(
                &format!(
                    "/apis/custom.metrics/namespaces/{}/{}/{}/{}",
                    namespace,
                    object.resource(),
                    object.name,
                    metric
                ),
                &[("metricSelector", metric_selector.to_string())],
            )
            .await?;
        Ok((value.value, value.timestamp))
    }

    async fn get_external_metric(
        &self,
        metric: &str,
        namespace: &str,
        metric_selector: &Labels,
    ) -> Result<(Vec<i64>, NaiveDateTime)> {
        let values: Vec<MetricValue> = self
            .get(
                &format!("/apis/external.metrics/namespaces/{}/{}", namespace, metric),
                &[("metricSelector", metric_selector.to_string())],
            )
            .await?;
        let timestamp = values
            .first()
            .map(|value| value.timestamp)
            .ok_or_else(|| anyhow!("no metrics returned for {} from external metrics API", metric))?;
        Ok((values.into_iter().map(|value| value.value).collect(), timestamp))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{extract::Query, routing::get, Json, Router};
    use resources::{models::Response, objects::metrics::ContainerMetrics};

    use super::*;
    use crate::utils::test_server;

    fn at(secs: i64) -> NaiveDateTime {
        NaiveDateTime::from_timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn pod_metrics(name: &str, containers: &[(&str, Option<i64>)]) -> PodMetrics {
        PodMetrics {
            name: name.to_string(),
            timestamp: at(0),
            window: 30,
            containers: containers
                .iter()
                .map(|(name, cpu)| ContainerMetrics {
                    name: name.to_string(),
                    usage: cpu.iter().map(|cpu| (Resource::CPU, *cpu)).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn usage_sums_containers() {
        let metrics = vec![
            pod_metrics("a", &[("app", Some(200)), ("sidecar", Some(50))]),
            pod_metrics("b", &[("app", Some(300)), ("sidecar", None)]),
        ];
        let (info, timestamp) = resource_usage(metrics.clone(), Resource::CPU, None).unwrap();
        assert_eq!(timestamp, at(0));
        assert_eq!(info["a"].value, 250);
        assert!(!info.contains_key("b"));

        let (info, _) = resource_usage(metrics, Resource::CPU, Some("app")).unwrap();
        assert_eq!(info["a"].value, 200);
        assert_eq!(info["b"].value, 300);
    }

    #[test]
    fn no_samples_is_an_error() {
        assert!(resource_usage(vec![], Resource::Memory, None).is_err());
        assert!(per_pod(vec![], "qps").is_err());
    }

    #[tokio::test]
    async fn raw_metric_keyed_by_pod() {
        let app = Router::new().route(
            "/apis/custom.metrics/namespaces/:namespace/pods/:metric",
            get(|Query(query): Query<HashMap<String, String>>| async move {
                assert_eq!(query["selector"], "app=web");
                assert_eq!(query["metricSelector"], "path=/");
                Json(Response::new(
                    None,
                    Some(vec![
                        MetricValue {
                            described_object: Some("web-1".to_string()),
                            timestamp: at(5),
                            window: 60,
                            value: 1500,
                        },
                        MetricValue {
                            described_object: Some("web-2".to_string()),
                            timestamp: at(5),
                            window: 60,
                            value: 500,
                        },
                    ]),
                ))
            }),
        );
        let client = RestClient::new(format!("http://{}", test_server::serve(app)));
        let (info, timestamp) = client
            .get_raw_metric(
                "qps",
                "default",
                &"app=web".parse().unwrap(),
                &"path=/".parse().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(timestamp, at(5));
        assert_eq!(info.len(), 2);
        assert_eq!(info["web-1"].value, 1500);
    }
}
