#[macro_use]
extern crate lazy_static;

use std::sync::Arc;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use resources::config::autoscaler::AutoscalerConfig;

use crate::{controller::PodAutoscaler, utils::RestClient};

mod aggregator;
mod controller;
mod error;
mod informer;
mod ledger;
mod metrics;
mod normalizer;
mod queue;
mod replica_calculator;
mod scalers;
#[cfg(test)]
mod testing;
mod utils;

lazy_static! {
    pub static ref CONFIG: AutoscalerConfig = load_config();
}

/// The config file, overridden by `GPA_` variables,
/// e.g. `GPA_WORKERS=4` or `GPA_CLUSTER__APISERVERURL=http://master:8080`.
fn load_config() -> AutoscalerConfig {
    Config::builder()
        .add_source(File::with_name("/etc/rminik8s/general-podautoscaler.yaml").required(false))
        .add_source(
            Environment::with_prefix("GPA")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .unwrap_or_default()
        .try_deserialize::<AutoscalerConfig>()
        .with_context(|| "Failed to parse config".to_string())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let client = Arc::new(RestClient::new(CONFIG.cluster.api_server_url.clone()));
    let controller = Arc::new(PodAutoscaler::new(
        CONFIG.clone(),
        client.clone(),
        client.clone(),
        client.clone(),
        client,
    ));
    controller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await
}
