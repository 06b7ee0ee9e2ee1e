use chrono::{Duration, NaiveDateTime, TimeZone, Utc};
use croner::Cron;
use resources::objects::gpa::TimeRange;

/// Proposes the replicas of the time ranges whose schedule fired recently.
pub struct CronScaler {
    ranges: Vec<TimeRange>,
    /// How far back to start walking a schedule.
    lookback: Duration,
    /// How long a range stays active after it fired.
    active_window: Duration,
}

impl CronScaler {
    pub fn new(ranges: Vec<TimeRange>, lookback: Duration, active_window: Duration) -> Self {
        Self {
            ranges,
            lookback,
            active_window,
        }
    }

    /// Largest `desired_replicas` among the active ranges.
    pub fn get_replicas(&self, now: NaiveDateTime) -> Option<u32> {
        self.ranges
            .iter()
            .filter(|range| self.is_active(range, now))
            .map(|range| range.desired_replicas)
            .max()
    }

    fn is_active(&self, range: &TimeRange, now: NaiveDateTime) -> bool {
        match self.last_fired(&range.schedule, now) {
            Ok(Some(fired)) => now - fired <= self.active_window,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!("Invalid schedule \"{}\": {}", range.schedule, err);
                false
            },
        }
    }

    /// Last occurrence of `schedule` within the lookback that is not after `now`.
    fn last_fired(
        &self,
        schedule: &str,
        now: NaiveDateTime,
    ) -> Result<Option<NaiveDateTime>, croner::errors::CronError> {
        let cron = Cron::new(schedule).parse()?;
        let now = Utc.from_utc_datetime(&now);
        let mut cursor = now - self.lookback;
        let mut last_fired = None;
        loop {
            let next = cron.find_next_occurrence(&cursor, false)?;
            if next > now {
                break;
            }
            last_fired = Some(next.naive_utc());
            cursor = next;
        }
        Ok(last_fired)
    }
}
