use chrono::NaiveDateTime;
use resources::{config::autoscaler::AutoscalerConfig, objects::gpa::GeneralPodAutoscaler};

use crate::error::ScalerError;

mod cron;
mod event;
mod webhook;

pub use self::{cron::CronScaler, event::EventScaler, webhook::WebhookScaler};

/// A non-metric source of replica proposals.
pub enum Scaler {
    Webhook(WebhookScaler),
    Cron(CronScaler),
    Event(EventScaler),
}

impl Scaler {
    pub fn name(&self) -> &'static str {
        match self {
            Scaler::Webhook(_) => "webhook",
            Scaler::Cron(_) => "cron",
            Scaler::Event(_) => "event",
        }
    }

    /// `None` means the scaler has no opinion this tick.
    pub async fn get_replicas(
        &self,
        gpa: &GeneralPodAutoscaler,
        current_replicas: u32,
        now: NaiveDateTime,
    ) -> Result<Option<u32>, ScalerError> {
        let result = match self {
            Scaler::Webhook(scaler) => scaler.get_replicas(gpa, current_replicas).await,
            Scaler::Cron(scaler) => Ok(scaler.get_replicas(now)),
            Scaler::Event(scaler) => Ok(scaler.get_replicas()),
        };
        result.map_err(|kind| ScalerError {
            scaler: self.name(),
            kind,
        })
    }
}

#[derive(Debug, Default)]
pub struct ChainOutcome {
    /// Highest proposal among the scalers with an opinion.
    pub replicas: Option<u32>,
    pub errors: Vec<ScalerError>,
}

/// The simple scalers configured on one autoscaler.
pub struct ScalerChain {
    scalers: Vec<Scaler>,
}

impl ScalerChain {
    pub fn new(gpa: &GeneralPodAutoscaler, config: &AutoscalerConfig) -> Self {
        let mode = &gpa.spec.driven_mode;
        let mut scalers = Vec::new();
        if let Some(webhook) = &mode.webhook {
            scalers.push(Scaler::Webhook(WebhookScaler::new(
                webhook.clone(),
                config.webhook_timeout(),
            )));
        }
        if let Some(time) = &mode.time {
            scalers.push(Scaler::Cron(CronScaler::new(
                time.ranges.clone(),
                chrono::Duration::seconds(config.cron_lookback as i64),
                chrono::Duration::seconds(config.cron_active_window as i64),
            )));
        }
        if let Some(event) = &mode.event {
            scalers.push(Scaler::Event(EventScaler::new(event)));
        }
        Self {
            scalers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scalers.is_empty()
    }

    /// Ask every scaler. A failing scaler is logged and skipped.
    pub async fn get_replicas(
        &self,
        gpa: &GeneralPodAutoscaler,
        current_replicas: u32,
        now: NaiveDateTime,
    ) -> ChainOutcome {
        let mut outcome = ChainOutcome::default();
        for scaler in &self.scalers {
            match scaler.get_replicas(gpa, current_replicas, now).await {
                Ok(Some(replicas)) => {
                    tracing::debug!("{} scaler proposes {} replicas", scaler.name(), replicas);
                    outcome.replicas = outcome.replicas.max(Some(replicas));
                },
                Ok(None) => {},
                Err(err) => {
                    tracing::warn!("{}", err);
                    outcome.errors.push(err);
                },
            }
        }
        outcome
    }
}
