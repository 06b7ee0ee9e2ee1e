use chrono::{Duration, NaiveDateTime};
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub replicas: u32,
    pub time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleEvent {
    /// Magnitude of the change, the direction is given by the ledger holding it.
    pub change: u32,
    pub time: NaiveDateTime,
    /// Older than the longest policy period, free for reuse.
    pub outdated: bool,
}

/// Everything the controller remembers about one autoscaler between ticks.
#[derive(Debug, Default)]
pub struct ObjectState {
    /// Desired replicas recommendations
    pub recommendations: Vec<Recommendation>,
    pub scale_up_events: Vec<ScaleEvent>,
    pub scale_down_events: Vec<ScaleEvent>,
}

impl ObjectState {
    /// Overwrite the recommendation at `stale`, or append when nothing is stale.
    pub fn store_recommendation(&mut self, stale: Option<usize>, recommendation: Recommendation) {
        match stale {
            Some(index) => self.recommendations[index] = recommendation,
            None => self.recommendations.push(recommendation),
        }
    }

    /// Record a change of the target from `prev_replicas` to `new_replicas`.
    ///
    /// A direction keeps at most `capacity` events, one per policy. Events
    /// older than the longest period of the direction are recycled first.
    /// With every slot still in use, the change is folded into the newest
    /// slot, which keeps the totals of `replicas_change_in_period`.
    pub fn store_scale_event(
        &mut self,
        prev_replicas: u32,
        new_replicas: u32,
        longest_period: u32,
        capacity: usize,
        now: NaiveDateTime,
    ) {
        let (events, change) = if new_replicas > prev_replicas {
            (&mut self.scale_up_events, new_replicas - prev_replicas)
        } else if new_replicas < prev_replicas {
            (&mut self.scale_down_events, prev_replicas - new_replicas)
        } else {
            return;
        };
        mark_outdated(events, longest_period, now);
        let event = ScaleEvent {
            change,
            time: now,
            outdated: false,
        };
        if let Some(slot) = events.iter_mut().find(|event| event.outdated) {
            *slot = event;
        } else if events.len() < capacity.max(1) {
            events.push(event);
        } else if let Some(newest) = events.iter_mut().max_by_key(|event| event.time) {
            newest.change += change;
            newest.time = now;
        }
    }
}

/// Total change recorded strictly after `now - period_seconds`.
pub fn replicas_change_in_period(
    events: &[ScaleEvent],
    period_seconds: u32,
    now: NaiveDateTime,
) -> u32 {
    let cutoff = now - Duration::seconds(period_seconds.into());
    events
        .iter()
        .filter(|event| event.time > cutoff)
        .map(|event| event.change)
        .sum()
}

fn mark_outdated(events: &mut [ScaleEvent], period_seconds: u32, now: NaiveDateTime) {
    let cutoff = now - Duration::seconds(period_seconds.into());
    for event in events.iter_mut().filter(|event| event.time < cutoff) {
        tracing::debug!("Outdated scale event: {:?}", event);
        event.outdated = true;
    }
}

/// Per-object ledgers keyed by `namespace/name`.
///
/// Entries of different keys are independent. The work queue guarantees that
/// at most one reconcile of a key is in flight, so an entry has a single
/// writer at a time.
#[derive(Debug, Default)]
pub struct LedgerStore {
    objects: DashMap<String, ObjectState>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the state of `key`, creating it when absent.
    /// The entry stays locked while `f` runs, so `f` must not block.
    pub fn with<R>(&self, key: &str, f: impl FnOnce(&mut ObjectState) -> R) -> R {
        let mut state = self.objects.entry(key.to_owned()).or_default();
        f(state.value_mut())
    }

    /// Seed the recommendations of a key seen for the first time.
    pub fn record_initial_recommendation(&self, key: &str, replicas: u32, now: NaiveDateTime) {
        self.objects
            .entry(key.to_owned())
            .or_insert_with(|| ObjectState {
                recommendations: vec![Recommendation {
                    replicas,
                    time: now,
                }],
                ..Default::default()
            });
    }

    pub fn purge(&self, key: &str) {
        if self.objects.remove(key).is_some() {
            tracing::debug!("Purged ledgers of {}", key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> NaiveDateTime {
        NaiveDateTime::from_timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn scale_events_go_to_direction_ledger() {
        let mut state = ObjectState::default();
        state.store_scale_event(3, 6, 15, 1, at(0));
        state.store_scale_event(6, 4, 15, 1, at(1));
        state.store_scale_event(4, 4, 15, 1, at(2));

        assert_eq!(state.scale_up_events.len(), 1);
        assert_eq!(state.scale_up_events[0].change, 3);
        assert_eq!(state.scale_down_events.len(), 1);
        assert_eq!(state.scale_down_events[0].change, 2);
    }

    #[test]
    fn outdated_events_are_recycled() {
        let mut state = ObjectState::default();
        for i in 0..10 {
            state.store_scale_event(1, 2, 15, 1, at(i * 60));
        }
        assert_eq!(state.scale_up_events.len(), 1);
        assert_eq!(state.scale_up_events[0].time, at(540));
        assert!(!state.scale_up_events[0].outdated);
    }

    #[test]
    fn events_within_period_are_kept() {
        let mut state = ObjectState::default();
        state.store_scale_event(1, 2, 60, 2, at(0));
        state.store_scale_event(2, 4, 60, 2, at(10));
        state.store_scale_event(4, 5, 60, 2, at(100));

        assert_eq!(state.scale_up_events.len(), 2);
        assert_eq!(replicas_change_in_period(&state.scale_up_events, 60, at(100)), 1);
        assert_eq!(replicas_change_in_period(&state.scale_up_events, 100, at(100)), 3);
    }

    #[test]
    fn frequent_scales_fold_into_policy_slots() {
        let mut state = ObjectState::default();
        for i in 0..4 {
            state.store_scale_event(i + 1, i + 2, 60, 1, at(i as i64 * 15));
        }
        assert_eq!(state.scale_up_events.len(), 1);
        assert_eq!(state.scale_up_events[0].change, 4);
        assert_eq!(state.scale_up_events[0].time, at(45));
        assert_eq!(replicas_change_in_period(&state.scale_up_events, 60, at(45)), 4);

        // Two policies keep two slots, the third change joins the newest
        let mut state = ObjectState::default();
        state.store_scale_event(6, 5, 60, 2, at(0));
        state.store_scale_event(5, 3, 60, 2, at(10));
        state.store_scale_event(3, 2, 60, 2, at(20));
        assert_eq!(state.scale_down_events.len(), 2);
        assert_eq!(state.scale_down_events[0].change, 1);
        assert_eq!(state.scale_down_events[1].change, 3);
        assert_eq!(replicas_change_in_period(&state.scale_down_events, 60, at(20)), 4);
    }

    #[test]
    fn change_in_period_excludes_cutoff() {
        let events = vec![ScaleEvent {
            change: 2,
            time: at(0),
            outdated: false,
        }];
        assert_eq!(replicas_change_in_period(&events, 15, at(14)), 2);
        assert_eq!(replicas_change_in_period(&events, 15, at(15)), 0);
    }

    #[test]
    fn store_seeds_once_and_purges() {
        let store = LedgerStore::new();
        store.record_initial_recommendation("ns/a", 3, at(0));
        store.record_initial_recommendation("ns/a", 7, at(1));
        let recommendations = store.with("ns/a", |state| state.recommendations.clone());
        assert_eq!(recommendations, vec![Recommendation {
            replicas: 3,
            time: at(0),
        }]);

        store.purge("ns/a");
        assert!(!store.contains("ns/a"));
    }
}
