use std::{future::Future, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Local, NaiveDateTime};
use resources::{
    config::autoscaler::AutoscalerConfig,
    objects::{
        gpa::{
            ConditionStatus, ConditionType, GeneralPodAutoscaler, GeneralPodAutoscalerStatus,
        },
        Object,
    },
};
use tokio::{select, sync::mpsc, task::JoinHandle};

use crate::{
    aggregator::MetricAggregator,
    informer::{Event, Informer, Store},
    metrics::MetricsSource,
    normalizer::{combine_proposals, NormalizationArgs, Normalizer},
    queue::{FixedItemIntervalRateLimiter, WorkQueue},
    replica_calculator::ReplicaCalculator,
    scalers::ScalerChain,
    utils::{AutoscalerClient, PodLister, ScaleClient},
};

pub struct PodAutoscaler {
    config: AutoscalerConfig,
    autoscalers: Arc<dyn AutoscalerClient>,
    scales: Arc<dyn ScaleClient>,
    aggregator: MetricAggregator,
    normalizer: Normalizer,
    queue: Arc<WorkQueue>,
    informer: Arc<Informer>,
    store: Store<GeneralPodAutoscaler>,
}

impl PodAutoscaler {
    pub fn new(
        config: AutoscalerConfig,
        autoscalers: Arc<dyn AutoscalerClient>,
        scales: Arc<dyn ScaleClient>,
        metrics: Arc<dyn MetricsSource>,
        pods: Arc<dyn PodLister>,
    ) -> Self {
        let calculator = ReplicaCalculator::new(
            metrics,
            pods,
            config.tolerance,
            Duration::seconds(config.cpu_initialization_period as i64),
            Duration::seconds(config.delay_of_initial_readiness_status as i64),
        );
        let informer = Informer::new(autoscalers.clone(), config.list_period());
        let store = informer.get_store();
        let queue = WorkQueue::new(FixedItemIntervalRateLimiter::new(config.resync_period()));

        Self {
            aggregator: MetricAggregator::new(calculator),
            normalizer: Normalizer::new(config.downscale_stabilization_window as u32),
            queue: Arc::new(queue),
            informer: Arc::new(informer),
            store,
            autoscalers,
            scales,
            config,
        }
    }

    /// Run until `shutdown` resolves, then let the workers drain.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<()> {
        tracing::info!("General Pod Autoscaler started");

        let (tx, mut rx) = mpsc::channel::<Event<GeneralPodAutoscaler>>(16);
        let informer = {
            let informer = self.informer.clone();
            tokio::spawn(async move { informer.run(tx).await })
        };
        let pump = {
            let queue = self.queue.clone();
            tokio::spawn(async move { queue.run_delay_pump().await })
        };
        let workers: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|_| {
                let controller = self.clone();
                tokio::spawn(async move { controller.run_worker().await })
            })
            .collect();

        tokio::pin!(shutdown);
        loop {
            select! {
                Some(event) = rx.recv() => self.handle_event(event),
                _ = &mut shutdown => {
                    tracing::info!("Shutting down");
                    break;
                },
                else => break
            }
        }

        self.queue.shut_down();
        for worker in workers {
            worker.await?;
        }
        informer.abort();
        pump.abort();
        tracing::info!("General Pod Autoscaler exited");
        Ok(())
    }

    fn handle_event(&self, event: Event<GeneralPodAutoscaler>) {
        match event {
            Event::Add(gpa) => {
                tracing::info!("General Pod Autoscaler {} added", gpa.key());
                self.queue.add(&gpa.key());
            },
            Event::Update(old, new) => {
                // Status writes of our own come back as updates too
                if old.spec != new.spec {
                    tracing::info!("General Pod Autoscaler {} updated", new.key());
                    self.queue.add(&new.key());
                }
            },
            Event::Delete(gpa) => {
                let key = gpa.key();
                tracing::info!("General Pod Autoscaler {} deleted", key);
                self.queue.forget(&key);
                self.normalizer.purge(&key);
            },
        }
    }

    async fn run_worker(&self) {
        while let Some(key) = self.queue.get().await {
            self.process_key(&key).await;
            self.queue.done(&key);
        }
    }

    async fn process_key(&self, key: &str) {
        let object = self.store.read().await.get(key).cloned();
        match object {
            Some(gpa) => {
                let now = Local::now().naive_utc();
                match self.reconcile(gpa, now).await {
                    Ok(_) => tracing::info!("Reconciled {}", key),
                    Err(e) => tracing::error!("Error reconciling {}: {:#}", key, e),
                }
                self.queue.add_rate_limited(key);
                tracing::debug!(
                    "Requeued {} ({} requeues)",
                    key,
                    self.queue.num_requeues(key)
                );
            },
            None => {
                tracing::info!("General Pod Autoscaler {} no longer exists", key);
                self.queue.forget(key);
                self.normalizer.purge(key);
            },
        }
    }

    async fn reconcile(&self, gpa: GeneralPodAutoscaler, now: NaiveDateTime) -> Result<()> {
        let key = gpa.key();
        let target = &gpa.spec.scale_target_ref;
        let mut status = gpa.status.clone().unwrap_or_default();

        let scale = match self.scales.get_scale(gpa.namespace(), target).await {
            Ok(scale) => scale,
            Err(err) => {
                let message = format!(
                    "the GPA controller was unable to get the target's current scale: {:#}",
                    err
                );
                status.set_condition(
                    ConditionType::AbleToScale,
                    ConditionStatus::False,
                    "FailedGetScale",
                    &message,
                    now,
                );
                warning_event(&key, "FailedGetScale", &message);
                self.update_status_if_needed(&gpa, status).await?;
                return Err(err.context(format!("failed to query scale subresource for {}", target)));
            },
        };
        status.set_condition(
            ConditionType::AbleToScale,
            ConditionStatus::True,
            "SucceededGetScale",
            "the GPA controller was able to get the target's current scale",
            now,
        );

        let current_replicas = scale.spec_replicas;
        let min_replicas = gpa.spec.min_replicas;
        let max_replicas = gpa.spec.max_replicas;
        self.normalizer
            .record_initial_recommendation(&key, current_replicas, now);

        let mut rescale = true;
        let mut metric_statuses = Vec::new();
        let mut rescale_reason = String::new();
        let desired_replicas = if current_replicas == 0 && min_replicas != 0 {
            rescale = false;
            status.set_condition(
                ConditionType::ScalingActive,
                ConditionStatus::False,
                "ScalingDisabled",
                "scaling is disabled since the replica count of the target is zero",
                now,
            );
            0
        } else if current_replicas > max_replicas {
            rescale_reason = "Current number of replicas above Spec.MaxReplicas".to_string();
            max_replicas
        } else if current_replicas < min_replicas {
            rescale_reason = "Current number of replicas below Spec.MinReplicas".to_string();
            min_replicas
        } else {
            let aggregation = match &gpa.spec.driven_mode.metric {
                Some(mode) if !mode.metrics.is_empty() => Some(
                    self.aggregator
                        .compute_replicas_for_metrics(&gpa, &scale, &mode.metrics, now)
                        .await,
                ),
                _ => None,
            };
            let chain = ScalerChain::new(&gpa, &self.config);
            let outcome = chain.get_replicas(&gpa, current_replicas, now).await;
            for err in &outcome.errors {
                warning_event(&key, "FailedGetScalerReplicas", &err.to_string());
            }

            let mut metric_name = None;
            let metric_replicas = match aggregation {
                Some(Ok(aggregation)) => {
                    status.set_condition(
                        ConditionType::ScalingActive,
                        ConditionStatus::True,
                        "ValidMetricFound",
                        format!(
                            "the GPA was able to successfully calculate a replica count from {}",
                            aggregation.metric
                        ),
                        now,
                    );
                    metric_statuses = aggregation.statuses;
                    metric_name = Some(aggregation.metric);
                    Some(aggregation.replicas)
                },
                Some(Err(err)) => {
                    status.set_condition(
                        ConditionType::ScalingActive,
                        ConditionStatus::False,
                        err.reason(),
                        format!("the GPA was unable to compute the replica count: {}", err),
                        now,
                    );
                    warning_event(&key, "FailedComputeMetricsReplicas", &err.to_string());
                    if outcome.replicas.is_none() {
                        status.current_replicas = current_replicas;
                        self.update_status_if_needed(&gpa, status).await?;
                        return Err(anyhow!(
                            "failed to compute desired number of replicas based on listed metrics for {}: {}",
                            target,
                            err
                        ));
                    }
                    None
                },
                None => {
                    if outcome.replicas.is_some() {
                        status.set_condition(
                            ConditionType::ScalingActive,
                            ConditionStatus::True,
                            "ValidScalerFound",
                            "the GPA was able to calculate a replica count from its scalers",
                            now,
                        );
                    }
                    None
                },
            };

            let proposal = combine_proposals(current_replicas, metric_replicas, outcome.replicas);
            let source = match metric_name {
                Some(name) if metric_replicas >= outcome.replicas => name,
                _ => "scalers".to_string(),
            };
            rescale_reason = if proposal > current_replicas {
                format!("{} above target", source)
            } else {
                "All metrics below target".to_string()
            };

            let normalization = self.normalizer.normalize(
                NormalizationArgs {
                    key: &key,
                    current_replicas,
                    min_replicas,
                    max_replicas,
                    desired_replicas: proposal,
                },
                gpa.spec.behavior.as_ref(),
                now,
            );
            status.set_condition(
                ConditionType::AbleToScale,
                ConditionStatus::True,
                &normalization.stabilization.to_string(),
                normalization.stabilization.message(),
                now,
            );
            status.set_condition(
                ConditionType::ScalingLimited,
                if normalization.is_limited() {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                &normalization.limit.to_string(),
                normalization.limit.message(),
                now,
            );
            normalization.desired_replicas
        };

        let rescale = rescale && desired_replicas != current_replicas;
        if rescale {
            if let Err(err) = self
                .scales
                .update_scale(gpa.namespace(), target, desired_replicas)
                .await
            {
                let message = format!(
                    "the GPA controller was unable to update the target scale: {:#}",
                    err
                );
                status.set_condition(
                    ConditionType::AbleToScale,
                    ConditionStatus::False,
                    "FailedUpdateScale",
                    &message,
                    now,
                );
                warning_event(
                    &key,
                    "FailedRescale",
                    &format!("New size: {}; error: {:#}", desired_replicas, err),
                );
                status.current_replicas = current_replicas;
                self.update_status_if_needed(&gpa, status).await?;
                return Err(err.context(format!("failed to rescale {}", target)));
            }
            status.set_condition(
                ConditionType::AbleToScale,
                ConditionStatus::True,
                "SucceededRescale",
                format!(
                    "the GPA controller was able to update the target scale to {}",
                    desired_replicas
                ),
                now,
            );
            normal_event(
                &key,
                "SuccessfulRescale",
                &format!("New size: {}; reason: {}", desired_replicas, rescale_reason),
            );
            self.normalizer.record_scale_event(
                &key,
                gpa.spec.behavior.as_ref(),
                current_replicas,
                desired_replicas,
                now,
            );
            tracing::info!(
                "Scaled {} from {} to {}, reason: {}",
                target,
                current_replicas,
                desired_replicas,
                rescale_reason
            );
            status.last_scale_time = Some(now);
        } else {
            tracing::debug!(
                "Decided not to scale {} to {} (last scale time was {:?})",
                target,
                desired_replicas,
                status.last_scale_time
            );
        }

        status.current_replicas = current_replicas;
        status.desired_replicas = desired_replicas;
        status.current_metrics = metric_statuses;
        self.update_status_if_needed(&gpa, status).await
    }

    async fn update_status_if_needed(
        &self,
        gpa: &GeneralPodAutoscaler,
        status: GeneralPodAutoscalerStatus,
    ) -> Result<()> {
        if gpa.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut gpa = gpa.clone();
        gpa.status = Some(status);
        self.autoscalers
            .update_status(&gpa)
            .await
            .with_context(|| format!("Failed to update status of {}", gpa.key()))
    }
}

fn normal_event(key: &str, reason: &str, message: &str) {
    tracing::info!(object = key, reason, "{}", message);
}

fn warning_event(key: &str, reason: &str, message: &str) {
    tracing::warn!(object = key, reason, "{}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, pod, FakeAutoscalers, FakeMetrics, FakePods, FakeScales, PodState};

    const AUTOSCALER: &str = r#"
metadata:
  name: web
spec:
  maxReplicas: 10
  scaleTargetRef:
    kind: Deployment
    name: web
  metric:
    metrics:
      - type: Pods
        metric:
          name: qps
        target:
          averageValue: 10000
"#;

    const CRON: &str = r#"
  time:
    ranges:
      - schedule: "* * * * *"
        desiredReplicas: 3
"#;

    struct Fixture {
        controller: PodAutoscaler,
        autoscalers: Arc<FakeAutoscalers>,
        scales: Arc<FakeScales>,
    }

    impl Fixture {
        fn new(manifest: &str, scales: FakeScales, metrics: FakeMetrics) -> Self {
            let gpa: GeneralPodAutoscaler = serde_yaml::from_str(manifest).unwrap();
            let autoscalers = Arc::new(FakeAutoscalers::default());
            autoscalers.objects.lock().push(gpa);
            let scales = Arc::new(scales);
            let pods = vec![pod("p1", 1000, PodState::Ready), pod("p2", 1000, PodState::Ready)];
            let controller = PodAutoscaler::new(
                AutoscalerConfig {
                    list_period: 1,
                    ..Default::default()
                },
                autoscalers.clone(),
                scales.clone(),
                Arc::new(metrics),
                Arc::new(FakePods::new(pods)),
            );
            Self {
                controller,
                autoscalers,
                scales,
            }
        }

        fn gpa(&self) -> GeneralPodAutoscaler {
            self.autoscalers.get("default/web").unwrap()
        }

        fn status(&self) -> GeneralPodAutoscalerStatus {
            self.gpa().status.unwrap()
        }

        async fn reconcile(&self, now: NaiveDateTime) -> Result<()> {
            self.controller.reconcile(self.gpa(), now).await
        }
    }

    fn qps(value: i64) -> FakeMetrics {
        FakeMetrics::new().with_raw("qps", &[("p1", value), ("p2", value)])
    }

    fn condition(status: &GeneralPodAutoscalerStatus, type_: ConditionType) -> (ConditionStatus, String) {
        let condition = status.condition(type_).unwrap();
        (condition.status, condition.reason.clone())
    }

    #[tokio::test]
    async fn scale_up_is_rate_limited() {
        let fixture = Fixture::new(AUTOSCALER, FakeScales::default().with("web", 2), qps(40_000));
        fixture.reconcile(at(1000)).await.unwrap();

        assert_eq!(*fixture.scales.updates.lock(), [("web".to_string(), 4)]);
        let status = fixture.status();
        assert_eq!(status.current_replicas, 2);
        assert_eq!(status.desired_replicas, 4);
        assert_eq!(status.last_scale_time, Some(at(1000)));
        assert_eq!(status.current_metrics.len(), 1);
        assert_eq!(
            condition(&status, ConditionType::AbleToScale),
            (ConditionStatus::True, "SucceededRescale".to_string())
        );
        assert_eq!(
            condition(&status, ConditionType::ScalingActive),
            (ConditionStatus::True, "ValidMetricFound".to_string())
        );
        assert!(status
            .condition(ConditionType::ScalingActive)
            .unwrap()
            .message
            .ends_with("from pods metric qps"));
        assert_eq!(
            condition(&status, ConditionType::ScalingLimited),
            (ConditionStatus::True, "ScaleUpLimit".to_string())
        );
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let fixture = Fixture::new(AUTOSCALER, FakeScales::default().with("web", 2), qps(10_000));
        fixture.reconcile(at(1000)).await.unwrap();
        assert!(fixture.scales.updates.lock().is_empty());
        assert_eq!(*fixture.autoscalers.status_updates.lock(), 1);
        let status = fixture.status();
        assert_eq!(status.desired_replicas, 2);
        assert_eq!(
            condition(&status, ConditionType::AbleToScale),
            (ConditionStatus::True, "ReadyForNewScale".to_string())
        );
        assert_eq!(
            condition(&status, ConditionType::ScalingLimited),
            (ConditionStatus::False, "DesiredWithinRange".to_string())
        );

        fixture.reconcile(at(1015)).await.unwrap();
        assert_eq!(*fixture.autoscalers.status_updates.lock(), 1);
    }

    #[tokio::test]
    async fn metric_failure_without_scalers_fails_reconcile() {
        let fixture = Fixture::new(AUTOSCALER, FakeScales::default().with("web", 2), FakeMetrics::new());
        let err = fixture.reconcile(at(1000)).await.unwrap_err();
        assert!(err.to_string().contains("failed to compute desired number of replicas"));
        assert!(fixture.scales.updates.lock().is_empty());

        let status = fixture.status();
        assert_eq!(status.current_replicas, 2);
        assert_eq!(
            condition(&status, ConditionType::ScalingActive),
            (ConditionStatus::False, "FailedGetPodsMetric".to_string())
        );
    }

    #[tokio::test]
    async fn scalers_carry_on_when_metrics_fail() {
        let manifest = format!("{}{}", AUTOSCALER, CRON);
        let fixture = Fixture::new(&manifest, FakeScales::default().with("web", 2), FakeMetrics::new());
        fixture.reconcile(at(1000)).await.unwrap();

        assert_eq!(*fixture.scales.updates.lock(), [("web".to_string(), 3)]);
        let status = fixture.status();
        assert_eq!(status.desired_replicas, 3);
        assert!(status.current_metrics.is_empty());
        assert_eq!(
            condition(&status, ConditionType::ScalingActive),
            (ConditionStatus::False, "FailedGetPodsMetric".to_string())
        );
    }

    #[tokio::test]
    async fn higher_proposal_wins() {
        let manifest = format!("{}{}", AUTOSCALER, CRON);
        // Metrics propose 1, the time range 3
        let fixture = Fixture::new(&manifest, FakeScales::default().with("web", 2), qps(5_000));
        fixture.reconcile(at(1000)).await.unwrap();
        assert_eq!(*fixture.scales.updates.lock(), [("web".to_string(), 3)]);
    }

    #[tokio::test]
    async fn zero_replicas_disable_scaling() {
        let fixture = Fixture::new(AUTOSCALER, FakeScales::default().with("web", 0), qps(40_000));
        fixture.reconcile(at(1000)).await.unwrap();

        assert!(fixture.scales.updates.lock().is_empty());
        let status = fixture.status();
        assert_eq!(status.desired_replicas, 0);
        assert_eq!(
            condition(&status, ConditionType::ScalingActive),
            (ConditionStatus::False, "ScalingDisabled".to_string())
        );
    }

    #[tokio::test]
    async fn out_of_range_is_clamped_first() {
        let fixture = Fixture::new(AUTOSCALER, FakeScales::default().with("web", 12), FakeMetrics::new());
        fixture.reconcile(at(1000)).await.unwrap();
        assert_eq!(*fixture.scales.updates.lock(), [("web".to_string(), 10)]);
        assert_eq!(fixture.status().desired_replicas, 10);
    }

    #[tokio::test]
    async fn missing_target_fails_get_scale() {
        let fixture = Fixture::new(AUTOSCALER, FakeScales::default(), qps(40_000));
        let err = fixture.reconcile(at(1000)).await.unwrap_err();
        assert!(err.to_string().contains("failed to query scale subresource"));
        assert_eq!(
            condition(&fixture.status(), ConditionType::AbleToScale),
            (ConditionStatus::False, "FailedGetScale".to_string())
        );
    }

    #[tokio::test]
    async fn failed_update_keeps_last_scale_time() {
        let scales = FakeScales {
            fail_updates: true,
            ..Default::default()
        }
        .with("web", 2);
        let fixture = Fixture::new(AUTOSCALER, scales, qps(40_000));
        let err = fixture.reconcile(at(1000)).await.unwrap_err();
        assert!(err.to_string().contains("failed to rescale"));

        let status = fixture.status();
        assert_eq!(status.last_scale_time, None);
        assert_eq!(
            condition(&status, ConditionType::AbleToScale),
            (ConditionStatus::False, "FailedUpdateScale".to_string())
        );
    }

    #[tokio::test]
    async fn events_drive_the_queue_and_ledgers() {
        let fixture = Fixture::new(AUTOSCALER, FakeScales::default().with("web", 2), qps(10_000));
        let controller = &fixture.controller;
        let gpa = fixture.gpa();

        let mut status_only = gpa.clone();
        status_only.status = Some(GeneralPodAutoscalerStatus::default());
        controller.handle_event(Event::Update(gpa.clone(), status_only));
        assert!(controller.queue.is_empty());

        let mut resized = gpa.clone();
        resized.spec.max_replicas = 20;
        controller.handle_event(Event::Update(gpa.clone(), resized));
        assert_eq!(controller.queue.len(), 1);

        controller
            .normalizer
            .record_initial_recommendation("default/web", 2, at(0));
        controller.handle_event(Event::Delete(gpa));
        assert!(!controller.normalizer.ledgers().contains("default/web"));

        controller
            .normalizer
            .record_initial_recommendation("default/gone", 2, at(0));
        controller.process_key("default/gone").await;
        assert!(!controller.normalizer.ledgers().contains("default/gone"));
    }

    #[tokio::test]
    async fn run_scales_listed_autoscalers() {
        let fixture = Fixture::new(AUTOSCALER, FakeScales::default().with("web", 2), qps(40_000));
        let scales = fixture.scales.clone();
        let controller = Arc::new(fixture.controller);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(controller.run(async move {
            shutdown_rx.await.ok();
        }));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while scales.updates.lock().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(scales.updates.lock()[0], ("web".to_string(), 4));
    }
}
