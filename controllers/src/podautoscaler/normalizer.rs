use chrono::{Duration, NaiveDateTime};
use resources::objects::gpa::{
    GeneralPodAutoscalerBehavior, PolicySelection, ScalingPolicyType, ScalingRules,
};
use strum::Display;

use crate::ledger::{replicas_change_in_period, LedgerStore, ObjectState, Recommendation, ScaleEvent};

/// Without behavior, a single tick may scale up to at most
/// `max(SCALE_UP_LIMIT_FACTOR * current, SCALE_UP_LIMIT_MINIMUM)`.
const SCALE_UP_LIMIT_FACTOR: f64 = 2.0;
const SCALE_UP_LIMIT_MINIMUM: f64 = 4.0;

/// Why the desired replicas ended up where they did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LimitReason {
    DesiredWithinRange,
    ScaleUpLimit,
    ScaleDownLimit,
    TooManyReplicas,
    TooFewReplicas,
}

impl LimitReason {
    pub fn message(&self) -> &'static str {
        match self {
            LimitReason::DesiredWithinRange => "the desired count is within the acceptable range",
            LimitReason::ScaleUpLimit => {
                "the desired replica count is increasing faster than the maximum scale rate"
            },
            LimitReason::ScaleDownLimit => {
                "the desired replica count is decreasing faster than the maximum scale rate"
            },
            LimitReason::TooManyReplicas => {
                "the desired replica count is more than the maximum replica count"
            },
            LimitReason::TooFewReplicas => {
                "the desired replica count is less than the minimum replica count"
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StabilizationReason {
    ReadyForNewScale,
    ScaleUpStabilized,
    ScaleDownStabilized,
}

impl StabilizationReason {
    pub fn message(&self) -> &'static str {
        match self {
            StabilizationReason::ReadyForNewScale => "recommended size matches current size",
            StabilizationReason::ScaleUpStabilized => {
                "recent recommendations were lower than current one, applying the lowest recent recommendation"
            },
            StabilizationReason::ScaleDownStabilized => {
                "recent recommendations were higher than current one, applying the highest recent recommendation"
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizationArgs<'a> {
    pub key: &'a str,
    pub current_replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Combined proposal of metrics and simple scalers.
    pub desired_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalization {
    pub desired_replicas: u32,
    /// Recommendation after stabilization, before rate limits and bounds.
    pub stabilized_replicas: u32,
    pub stabilization: StabilizationReason,
    pub limit: LimitReason,
}

impl Normalization {
    /// Whether bounds or rate limits changed the stabilized recommendation.
    pub fn is_limited(&self) -> bool {
        self.desired_replicas != self.stabilized_replicas
    }
}

/// Combine the metric and simple scaler proposals into one recommendation.
/// With no opinion from either, the current count is kept.
pub fn combine_proposals(current: u32, metric: Option<u32>, simple: Option<u32>) -> u32 {
    metric.max(simple).unwrap_or(current)
}

/// Stabilizes and rate limits recommendations, owning the per-object ledgers.
pub struct Normalizer {
    ledgers: LedgerStore,
    /// Stabilization window without behavior, and the default scale down window.
    downscale_stabilization_window: u32,
}

impl Normalizer {
    pub fn new(downscale_stabilization_window: u32) -> Self {
        Self {
            ledgers: LedgerStore::new(),
            downscale_stabilization_window,
        }
    }

    pub fn ledgers(&self) -> &LedgerStore {
        &self.ledgers
    }

    pub fn record_initial_recommendation(&self, key: &str, replicas: u32, now: NaiveDateTime) {
        self.ledgers.record_initial_recommendation(key, replicas, now);
    }

    pub fn purge(&self, key: &str) {
        self.ledgers.purge(key);
    }

    pub fn normalize(
        &self,
        args: NormalizationArgs,
        behavior: Option<&GeneralPodAutoscalerBehavior>,
        now: NaiveDateTime,
    ) -> Normalization {
        let mut normalization = self.ledgers.with(args.key, |state| match behavior {
            Some(behavior) => {
                let scale_up = behavior.scale_up_rules();
                let scale_down = behavior.scale_down_rules(self.downscale_stabilization_window);
                normalize_with_behaviors(state, &args, &scale_up, &scale_down, now)
            },
            None => normalize_default(state, &args, self.downscale_stabilization_window, now),
        });

        // Holds on every path, also when current is already out of bounds
        if normalization.desired_replicas > args.max_replicas {
            normalization.desired_replicas = args.max_replicas;
            normalization.limit = LimitReason::TooManyReplicas;
        } else if normalization.desired_replicas < args.min_replicas {
            normalization.desired_replicas = args.min_replicas;
            normalization.limit = LimitReason::TooFewReplicas;
        }

        if normalization.stabilized_replicas != args.desired_replicas {
            tracing::info!(
                "Stabilized {} from {} to {}",
                args.key,
                args.desired_replicas,
                normalization.stabilized_replicas
            );
        }
        if normalization.is_limited() {
            tracing::info!(
                "Limited {} from {} to {}: {}",
                args.key,
                normalization.stabilized_replicas,
                normalization.desired_replicas,
                normalization.limit
            );
        }
        normalization
    }

    /// Remember a successful scale of `key` so later ticks respect the policies.
    /// Only autoscalers with behavior keep scale events.
    pub fn record_scale_event(
        &self,
        key: &str,
        behavior: Option<&GeneralPodAutoscalerBehavior>,
        prev_replicas: u32,
        new_replicas: u32,
        now: NaiveDateTime,
    ) {
        let behavior = match behavior {
            Some(behavior) => behavior,
            None => return,
        };
        tracing::debug!(
            "Record scale event for {}: {} -> {}",
            key,
            prev_replicas,
            new_replicas
        );
        let rules = if new_replicas > prev_replicas {
            behavior.scale_up_rules()
        } else {
            behavior.scale_down_rules(self.downscale_stabilization_window)
        };
        self.ledgers.with(key, |state| {
            state.store_scale_event(
                prev_replicas,
                new_replicas,
                rules.longest_period(),
                rules.policies.len(),
                now,
            )
        });
    }
}

/// Stabilize with the fixed window and cap a single scale up.
fn normalize_default(
    state: &mut ObjectState,
    args: &NormalizationArgs,
    window_seconds: u32,
    now: NaiveDateTime,
) -> Normalization {
    let stabilized = stabilize_recommendation(state, args.desired_replicas, window_seconds, now);
    let stabilization = if stabilized != args.desired_replicas {
        StabilizationReason::ScaleDownStabilized
    } else {
        StabilizationReason::ReadyForNewScale
    };
    let (desired_replicas, limit) = convert_desired_replicas_with_rules(
        args.current_replicas,
        stabilized,
        args.min_replicas,
        args.max_replicas,
    );
    Normalization {
        desired_replicas,
        stabilized_replicas: stabilized,
        stabilization,
        limit,
    }
}

/// Highest recommendation within the window, the new one included.
/// One expired sample is overwritten instead of growing the ledger.
pub fn stabilize_recommendation(
    state: &mut ObjectState,
    desired_replicas: u32,
    window_seconds: u32,
    now: NaiveDateTime,
) -> u32 {
    let cutoff = now - Duration::seconds(window_seconds.into());
    let mut recommendation = desired_replicas;
    let mut stale = None;
    for (i, rec) in state.recommendations.iter().enumerate() {
        if rec.time < cutoff {
            stale = Some(i);
        } else {
            recommendation = recommendation.max(rec.replicas);
        }
    }
    state.store_recommendation(stale, Recommendation {
        replicas: desired_replicas,
        time: now,
    });
    recommendation
}

pub fn calculate_scale_up_limit(current_replicas: u32) -> u32 {
    (SCALE_UP_LIMIT_FACTOR * current_replicas as f64).max(SCALE_UP_LIMIT_MINIMUM) as u32
}

fn convert_desired_replicas_with_rules(
    current_replicas: u32,
    desired_replicas: u32,
    min_replicas: u32,
    max_replicas: u32,
) -> (u32, LimitReason) {
    let scale_up_limit = calculate_scale_up_limit(current_replicas);
    let (maximum_allowed, reason) = if max_replicas > scale_up_limit {
        (scale_up_limit, LimitReason::ScaleUpLimit)
    } else {
        (max_replicas, LimitReason::TooManyReplicas)
    };
    if desired_replicas < min_replicas {
        (min_replicas, LimitReason::TooFewReplicas)
    } else if desired_replicas > maximum_allowed {
        (maximum_allowed, reason)
    } else {
        (desired_replicas, LimitReason::DesiredWithinRange)
    }
}

fn normalize_with_behaviors(
    state: &mut ObjectState,
    args: &NormalizationArgs,
    scale_up: &ScalingRules,
    scale_down: &ScalingRules,
    now: NaiveDateTime,
) -> Normalization {
    let (stabilized, stabilization) =
        stabilize_recommendation_with_behaviors(state, args, scale_up, scale_down, now);
    let stabilization = if stabilized != args.desired_replicas {
        stabilization
    } else {
        StabilizationReason::ReadyForNewScale
    };
    let (desired_replicas, limit) =
        convert_desired_replicas_with_behavior_rate(state, args, stabilized, scale_up, scale_down, now);
    Normalization {
        desired_replicas,
        stabilized_replicas: stabilized,
        stabilization,
        limit,
    }
}

/// Scaling up waits for consistently high recommendations (lowest in the
/// scale up window), scaling down for consistently low ones (highest in the
/// scale down window).
fn stabilize_recommendation_with_behaviors(
    state: &mut ObjectState,
    args: &NormalizationArgs,
    scale_up: &ScalingRules,
    scale_down: &ScalingRules,
    now: NaiveDateTime,
) -> (u32, StabilizationReason) {
    let (window, better, reason): (u32, fn(u32, u32) -> u32, _) =
        if args.desired_replicas >= args.current_replicas {
            (
                scale_up.stabilization_window(),
                std::cmp::min,
                StabilizationReason::ScaleUpStabilized,
            )
        } else {
            (
                scale_down.stabilization_window(),
                std::cmp::max,
                StabilizationReason::ScaleDownStabilized,
            )
        };
    let longest_window = scale_up
        .stabilization_window()
        .max(scale_down.stabilization_window());
    let obsolete_cutoff = now - Duration::seconds(longest_window.into());
    let cutoff = now - Duration::seconds(window.into());

    let mut recommendation = args.desired_replicas;
    let mut stale = None;
    for (i, rec) in state.recommendations.iter().enumerate() {
        if rec.time > cutoff {
            recommendation = better(rec.replicas, recommendation);
        }
        if rec.time < obsolete_cutoff {
            stale = Some(i);
        }
    }
    state.store_recommendation(stale, Recommendation {
        replicas: args.desired_replicas,
        time: now,
    });
    (recommendation, reason)
}

fn convert_desired_replicas_with_behavior_rate(
    state: &ObjectState,
    args: &NormalizationArgs,
    desired_replicas: u32,
    scale_up: &ScalingRules,
    scale_down: &ScalingRules,
    now: NaiveDateTime,
) -> (u32, LimitReason) {
    if desired_replicas > args.current_replicas {
        // No further scale up until older events leave their periods
        let scale_up_limit =
            calculate_scale_up_limit_with_rules(args.current_replicas, &state.scale_up_events, scale_up, now)
                .max(args.current_replicas);
        let (maximum_allowed, reason) = if args.max_replicas > scale_up_limit {
            (scale_up_limit, LimitReason::ScaleUpLimit)
        } else {
            (args.max_replicas, LimitReason::TooManyReplicas)
        };
        if desired_replicas > maximum_allowed {
            return (maximum_allowed, reason);
        }
    } else if desired_replicas < args.current_replicas {
        let scale_down_limit = calculate_scale_down_limit_with_rules(
            args.current_replicas,
            &state.scale_down_events,
            scale_down,
            now,
        )
        .min(args.current_replicas);
        let (minimum_allowed, reason) = if args.min_replicas < scale_down_limit {
            (scale_down_limit, LimitReason::ScaleDownLimit)
        } else {
            (args.min_replicas, LimitReason::TooFewReplicas)
        };
        if desired_replicas < minimum_allowed {
            return (minimum_allowed, reason);
        }
    }
    (desired_replicas, LimitReason::DesiredWithinRange)
}

/// Highest count the scale up policies allow right now.
pub fn calculate_scale_up_limit_with_rules(
    current_replicas: u32,
    events: &[ScaleEvent],
    rules: &ScalingRules,
    now: NaiveDateTime,
) -> u32 {
    // For scaling up, the lowest change ('Min' policy) produces a minimum value
    let (mut result, select_fn): (i64, fn(i64, i64) -> i64) = match rules.select_policy {
        PolicySelection::Disabled => return current_replicas,
        PolicySelection::Min => (i64::MAX, std::cmp::min),
        PolicySelection::Max => (i64::MIN, std::cmp::max),
    };
    for policy in &rules.policies {
        let replicas_added_in_current_period =
            replicas_change_in_period(events, policy.period_seconds, now);
        let period_start = current_replicas as i64 - replicas_added_in_current_period as i64;
        let proposed = match policy.type_ {
            ScalingPolicyType::Pods => period_start + policy.value as i64,
            // Rounded up, otherwise small targets could never grow
            ScalingPolicyType::Percent => {
                (period_start as f64 * (1.0 + policy.value as f64 / 100.0)).ceil() as i64
            },
        };
        result = select_fn(result, proposed);
    }
    clamp_to_replicas(result, current_replicas)
}

/// Lowest count the scale down policies allow right now.
pub fn calculate_scale_down_limit_with_rules(
    current_replicas: u32,
    events: &[ScaleEvent],
    rules: &ScalingRules,
    now: NaiveDateTime,
) -> u32 {
    // Minimum change results in maximum value
    let (mut result, select_fn): (i64, fn(i64, i64) -> i64) = match rules.select_policy {
        PolicySelection::Disabled => return current_replicas,
        PolicySelection::Min => (i64::MIN, std::cmp::max),
        PolicySelection::Max => (i64::MAX, std::cmp::min),
    };
    for policy in &rules.policies {
        let replicas_deleted_in_current_period =
            replicas_change_in_period(events, policy.period_seconds, now);
        let period_start = current_replicas as i64 + replicas_deleted_in_current_period as i64;
        let proposed = match policy.type_ {
            ScalingPolicyType::Pods => period_start - policy.value as i64,
            ScalingPolicyType::Percent => {
                (period_start as f64 * (1.0 - policy.value as f64 / 100.0)) as i64
            },
        };
        result = select_fn(result, proposed);
    }
    clamp_to_replicas(result, current_replicas)
}

/// Rules without policies leave the count unchanged.
fn clamp_to_replicas(limit: i64, current_replicas: u32) -> u32 {
    if limit == i64::MAX || limit == i64::MIN {
        current_replicas
    } else {
        limit.clamp(0, u32::MAX as i64) as u32
    }
}
