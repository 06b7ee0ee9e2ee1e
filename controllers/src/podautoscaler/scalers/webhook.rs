use std::time::Duration;

use reqwest::{Certificate, Client, StatusCode};
use resources::objects::{
    gpa::{GeneralPodAutoscaler, WebhookMode},
    webhook::{ScaleRequest, ScaleReview},
    Object,
};

use crate::error::ScalerErrorKind;

/// Asks an external service for the replica count.
pub struct WebhookScaler {
    mode: WebhookMode,
    timeout: Duration,
}

impl WebhookScaler {
    pub fn new(mode: WebhookMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
        }
    }

    fn url(&self) -> Result<String, ScalerErrorKind> {
        let config = &self.mode.client_config;
        match (&config.url, &config.service) {
            (Some(url), None) => Ok(url.to_owned()),
            (None, Some(service)) => {
                let scheme = if config.ca_bundle.is_some() {
                    "https"
                } else {
                    "http"
                };
                Ok(format!(
                    "{}://{}.{}.svc:{}{}",
                    scheme,
                    service.name,
                    service.namespace,
                    service.port,
                    service.path.as_deref().unwrap_or_default()
                ))
            },
            _ => Err(ScalerErrorKind::InvalidClientConfig),
        }
    }

    fn client(&self) -> Result<Client, ScalerErrorKind> {
        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(ca_bundle) = &self.mode.client_config.ca_bundle {
            let certificate = Certificate::from_pem(ca_bundle.as_bytes())
                .map_err(ScalerErrorKind::InvalidCaBundle)?;
            builder = builder.add_root_certificate(certificate);
        }
        Ok(builder.build()?)
    }

    pub async fn get_replicas(
        &self,
        gpa: &GeneralPodAutoscaler,
        current_replicas: u32,
    ) -> Result<Option<u32>, ScalerErrorKind> {
        let url = self.url()?;
        let uid = uuid::Uuid::new_v4().to_string();
        let review = ScaleReview {
            request: Some(ScaleRequest {
                uid: uid.clone(),
                name: gpa.spec.scale_target_ref.name.clone(),
                namespace: gpa.namespace().clone(),
                parameters: self.mode.parameters.clone(),
                current_replicas,
            }),
            response: None,
        };

        let response = self.client()?.post(&url).json(&review).send().await?;
        if response.status() != StatusCode::OK {
            return Err(ScalerErrorKind::Status(response.status()));
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(ScalerErrorKind::EmptyBody);
        }
        let review: ScaleReview = serde_json::from_slice(&body)?;
        let response = review.response.ok_or(ScalerErrorKind::MissingResponse)?;
        if response.uid != uid {
            tracing::warn!("Webhook {} answered request {} with uid {}", url, uid, response.uid);
        }

        if response.scale {
            Ok(Some(response.replicas))
        } else {
            // Explicitly keep the current count
            Ok(Some(current_replicas))
        }
    }
}
