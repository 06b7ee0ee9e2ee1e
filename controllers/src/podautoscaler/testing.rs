//! In-memory collaborators for unit tests.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use resources::objects::{
    gpa::GeneralPodAutoscaler,
    metrics::{PodMetric, PodMetricsInfo, Resource},
    object_reference::ObjectReference,
    pod::{
        Container, Pod, PodCondition, PodConditionType, PodPhase, PodSpec, PodStatus,
        ResourceRequirements,
    },
    scale::Scale,
    Labels, Metadata, Object,
};

use crate::{
    metrics::MetricsSource,
    utils::{AutoscalerClient, PodLister, ScaleClient},
};

pub fn at(secs: i64) -> NaiveDateTime {
    NaiveDateTime::from_timestamp_opt(1_600_000_000 + secs, 0).unwrap()
}

pub fn sample(value: i64) -> PodMetric {
    PodMetric {
        timestamp: at(990),
        window: 30,
        value,
    }
}

pub enum PodState {
    /// Running and ready for long.
    Ready,
    /// Running, started recently and not ready yet.
    Starting,
    Pending,
    Failed,
}

/// A pod labeled `app=web` with one container requesting `request` of every resource.
pub fn pod(name: &str, request: i64, state: PodState) -> Pod {
    let (phase, ready, started) = match state {
        PodState::Ready => (PodPhase::Running, true, at(0)),
        PodState::Starting => (PodPhase::Running, false, at(900)),
        PodState::Pending => (PodPhase::Pending, false, at(0)),
        PodState::Failed => (PodPhase::Failed, false, at(0)),
    };
    Pod {
        metadata: Metadata {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: [("app", "web")].into_iter().collect(),
            ..Default::default()
        },
        spec: PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources: ResourceRequirements {
                    requests: [(Resource::CPU, request), (Resource::Memory, request)]
                        .into_iter()
                        .collect(),
                    limits: HashMap::new(),
                },
            }],
        },
        status: Some(PodStatus {
            phase,
            start_time: Some(started),
            conditions: [(PodConditionType::Ready, PodCondition {
                status: ready,
                last_transition_time: Some(started),
            })]
            .into_iter()
            .collect(),
        }),
    }
}

pub struct FakeMetrics {
    resource: PodMetricsInfo,
    raw: HashMap<String, PodMetricsInfo>,
    object: HashMap<String, i64>,
    external: HashMap<String, Vec<i64>>,
    timestamp: NaiveDateTime,
}

impl FakeMetrics {
    pub fn new() -> Self {
        Self {
            resource: PodMetricsInfo::new(),
            raw: HashMap::new(),
            object: HashMap::new(),
            external: HashMap::new(),
            timestamp: at(990),
        }
    }

    pub fn with_resource(mut self, samples: &[(&str, i64)]) -> Self {
        self.resource = per_pod(samples);
        self
    }

    pub fn with_raw(mut self, metric: &str, samples: &[(&str, i64)]) -> Self {
        self.raw.insert(metric.to_string(), per_pod(samples));
        self
    }

    pub fn with_object(mut self, metric: &str, value: i64) -> Self {
        self.object.insert(metric.to_string(), value);
        self
    }

    pub fn with_external(mut self, metric: &str, values: &[i64]) -> Self {
        self.external.insert(metric.to_string(), values.to_vec());
        self
    }
}

fn per_pod(samples: &[(&str, i64)]) -> PodMetricsInfo {
    samples
        .iter()
        .map(|(name, value)| (name.to_string(), sample(*value)))
        .collect()
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn get_resource_metric(
        &self,
        resource: Resource,
        _namespace: &str,
        _selector: &Labels,
        _container: Option<&str>,
    ) -> Result<(PodMetricsInfo, NaiveDateTime)> {
        if self.resource.is_empty() {
            return Err(anyhow!("no {} metrics", resource));
        }
        Ok((self.resource.clone(), self.timestamp))
    }

    async fn get_raw_metric(
        &self,
        metric: &str,
        _namespace: &str,
        _selector: &Labels,
        _metric_selector: &Labels,
    ) -> Result<(PodMetricsInfo, NaiveDateTime)> {
        let metrics = self
            .raw
            .get(metric)
            .ok_or_else(|| anyhow!("unknown metric {}", metric))?;
        Ok((metrics.clone(), self.timestamp))
    }

    async fn get_object_metric(
        &self,
        metric: &str,
        _namespace: &str,
        _object: &ObjectReference,
        _metric_selector: &Labels,
    ) -> Result<(i64, NaiveDateTime)> {
        let value = self
            .object
            .get(metric)
            .ok_or_else(|| anyhow!("unknown metric {}", metric))?;
        Ok((*value, self.timestamp))
    }

    async fn get_external_metric(
        &self,
        metric: &str,
        _namespace: &str,
        _metric_selector: &Labels,
    ) -> Result<(Vec<i64>, NaiveDateTime)> {
        let values = self
            .external
            .get(metric)
            .ok_or_else(|| anyhow!("unknown metric {}", metric))?;
        Ok((values.clone(), self.timestamp))
    }
}

pub struct FakePods {
    pods: Vec<Pod>,
}

impl FakePods {
    pub fn new(pods: Vec<Pod>) -> Self {
        Self {
            pods,
        }
    }
}

#[async_trait]
impl PodLister for FakePods {
    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .iter()
            .filter(|pod| pod.namespace() == namespace && pod.metadata.labels.matches(selector))
            .cloned()
            .collect())
    }
}

/// Scale subresources keyed by target name, recording every update.
#[derive(Default)]
pub struct FakeScales {
    pub scales: Mutex<HashMap<String, Scale>>,
    pub updates: Mutex<Vec<(String, u32)>>,
    pub fail_updates: bool,
}

impl FakeScales {
    pub fn with(self, name: &str, replicas: u32) -> Self {
        self.scales.lock().insert(name.to_string(), Scale {
            spec_replicas: replicas,
            status_replicas: replicas,
            selector: "app=web".to_string(),
        });
        self
    }
}

#[async_trait]
impl ScaleClient for FakeScales {
    async fn get_scale(&self, _namespace: &str, target: &ObjectReference) -> Result<Scale> {
        target.scalable_resource()?;
        self.scales
            .lock()
            .get(&target.name)
            .cloned()
            .ok_or_else(|| anyhow!("{} not found", target))
    }

    async fn update_scale(
        &self,
        _namespace: &str,
        target: &ObjectReference,
        replicas: u32,
    ) -> Result<()> {
        if self.fail_updates {
            return Err(anyhow!("update of {} rejected", target));
        }
        self.updates.lock().push((target.name.clone(), replicas));
        if let Some(scale) = self.scales.lock().get_mut(&target.name) {
            scale.spec_replicas = replicas;
            scale.status_replicas = replicas;
        }
        Ok(())
    }
}

/// Autoscaler objects as the API server would hold them.
#[derive(Default)]
pub struct FakeAutoscalers {
    pub objects: Mutex<Vec<GeneralPodAutoscaler>>,
    pub status_updates: Mutex<usize>,
}

impl FakeAutoscalers {
    pub fn get(&self, key: &str) -> Option<GeneralPodAutoscaler> {
        self.objects.lock().iter().find(|gpa| gpa.key() == key).cloned()
    }
}

#[async_trait]
impl AutoscalerClient for FakeAutoscalers {
    async fn list_autoscalers(&self) -> Result<Vec<GeneralPodAutoscaler>> {
        Ok(self.objects.lock().clone())
    }

    async fn update_status(&self, gpa: &GeneralPodAutoscaler) -> Result<()> {
        *self.status_updates.lock() += 1;
        let mut objects = self.objects.lock();
        let object = objects
            .iter_mut()
            .find(|object| object.key() == gpa.key())
            .ok_or_else(|| anyhow!("{} not found", gpa.key()))?;
        object.status = gpa.status.clone();
        Ok(())
    }
}
