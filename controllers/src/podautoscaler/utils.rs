use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use resources::{
    models::{ErrResponse, Response},
    objects::{
        gpa::GeneralPodAutoscaler, object_reference::ObjectReference, pod::Pod, scale::Scale,
        Labels, Object,
    },
};
use serde::{de::DeserializeOwned, Serialize};

#[async_trait]
pub trait ScaleClient: Send + Sync {
    async fn get_scale(&self, namespace: &str, target: &ObjectReference) -> Result<Scale>;

    async fn update_scale(
        &self,
        namespace: &str,
        target: &ObjectReference,
        replicas: u32,
    ) -> Result<()>;
}

#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>>;
}

#[async_trait]
pub trait AutoscalerClient: Send + Sync {
    async fn list_autoscalers(&self) -> Result<Vec<GeneralPodAutoscaler>>;

    async fn update_status(&self, gpa: &GeneralPodAutoscaler) -> Result<()>;
}

/// Talks to the API server, every reply wrapped in a `Response` envelope.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn get<T: Serialize + DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", path))?;
        if !response.status().is_success() {
            return Err(error_of(path, response).await);
        }
        let response = response
            .json::<Response<T>>()
            .await
            .with_context(|| format!("Failed to decode response of {}", path))?;
        match response.data {
            Some(data) => Ok(data),
            None => Err(anyhow!(
                "{}: {}",
                path,
                response.msg.unwrap_or_else(|| "no data".to_string())
            )),
        }
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .client
            .put(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", path))?;
        if !response.status().is_success() {
            return Err(error_of(path, response).await);
        }
        let response = response
            .json::<Response<serde_json::Value>>()
            .await
            .with_context(|| format!("Failed to decode response of {}", path))?;
        if let Some(msg) = response.msg {
            tracing::debug!("{}", msg);
        }
        Ok(())
    }
}

/// Error of a failed reply, with the server's message when it sent one.
async fn error_of(path: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<ErrResponse>().await {
        Ok(ErrResponse { msg, cause: Some(cause) }) => anyhow!("{}: {}, caused by: {}", path, msg, cause),
        Ok(ErrResponse { msg, .. }) => anyhow!("{}: {}", path, msg),
        Err(_) => anyhow!("{}: {}", path, status),
    }
}

fn scale_path(namespace: &str, target: &ObjectReference) -> Result<String> {
    Ok(format!(
        "/api/v1/namespaces/{}/{}/{}/scale",
        namespace,
        target.scalable_resource()?,
        target.name
    ))
}

#[async_trait]
impl ScaleClient for RestClient {
    async fn get_scale(&self, namespace: &str, target: &ObjectReference) -> Result<Scale> {
        self.get(&scale_path(namespace, target)?, &[]).await
    }

    async fn update_scale(
        &self,
        namespace: &str,
        target: &ObjectReference,
        replicas: u32,
    ) -> Result<()> {
        let scale = Scale {
            spec_replicas: replicas,
            ..Default::default()
        };
        self.put(&scale_path(namespace, target)?, &scale).await
    }
}

#[async_trait]
impl PodLister for RestClient {
    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>> {
        self.get(
            &format!("/api/v1/namespaces/{}/pods", namespace),
            &[("selector", selector.to_string())],
        )
        .await
    }
}

#[async_trait]
impl AutoscalerClient for RestClient {
    async fn list_autoscalers(&self) -> Result<Vec<GeneralPodAutoscaler>> {
        self.get("/api/v1/generalpodautoscalers", &[]).await
    }

    async fn update_status(&self, gpa: &GeneralPodAutoscaler) -> Result<()> {
        let status = gpa
            .status
            .as_ref()
            .with_context(|| format!("{} has no status", gpa.key()))?;
        self.put(
            &format!(
                "/api/v1/namespaces/{}/generalpodautoscalers/{}/status",
                gpa.namespace(),
                gpa.name()
            ),
            status,
        )
        .await
    }
}
