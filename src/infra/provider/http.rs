//! reqwest client for the provider's REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CreateInstanceRequest, ProviderApi, ProviderInstance};
use crate::config::ProviderConfig;
use crate::core::{OrchestratorError, OrchestratorResult};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRef<'a> {
    instance_id: &'a str,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    instances: Vec<ProviderInstance>,
}

/// HTTP implementation of [`ProviderApi`].
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpProvider {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidConfig`] if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> OrchestratorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OrchestratorError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, op: &str) -> OrchestratorResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| transport_error(op, &e))?;
        let status = response.status();
        debug!(op, status = status.as_u16(), "provider responded");
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, format!("{op}: {body}")))
    }

    async fn post_ref(&self, path: &str, provider_id: &str, op: &str) -> OrchestratorResult<()> {
        let request = self
            .client
            .post(self.url(path))
            .json(&InstanceRef { instance_id: provider_id });
        self.send(request, op).await.map(|_| ())
    }

    async fn read_json<T: DeserializeOwned>(response: Response, op: &str) -> OrchestratorResult<T> {
        response.json().await.map_err(|e| OrchestratorError::PermanentUpstream {
            status: None,
            message: format!("{op}: malformed response: {e}"),
        })
    }
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
) -> OrchestratorError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        OrchestratorError::TransientUpstream {
            status: Some(status.as_u16()),
            message,
            retry_after,
        }
    } else {
        OrchestratorError::PermanentUpstream {
            status: Some(status.as_u16()),
            message,
        }
    }
}

fn transport_error(op: &str, err: &reqwest::Error) -> OrchestratorError {
    if err.is_timeout() {
        OrchestratorError::Timeout(format!("{op}: {err}"))
    } else {
        OrchestratorError::TransientUpstream {
            status: None,
            message: format!("{op}: {err}"),
            retry_after: None,
        }
    }
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl ProviderApi for HttpProvider {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> OrchestratorResult<String> {
        let response = self
            .send(
                self.client
                    .post(self.url("/gpu/instance/create"))
                    .json(request),
                "create_instance",
            )
            .await?;
        let created: CreateResponse = Self::read_json(response, "create_instance").await?;
        Ok(created.id)
    }

    async fn start_instance(&self, provider_id: &str) -> OrchestratorResult<()> {
        self.post_ref("/gpu/instance/start", provider_id, "start_instance").await
    }

    async fn stop_instance(&self, provider_id: &str) -> OrchestratorResult<()> {
        self.post_ref("/gpu/instance/stop", provider_id, "stop_instance").await
    }

    async fn delete_instance(&self, provider_id: &str) -> OrchestratorResult<()> {
        self.post_ref("/gpu/instance/delete", provider_id, "delete_instance").await
    }

    async fn migrate_instance(&self, provider_id: &str) -> OrchestratorResult<()> {
        self.post_ref("/gpu/instance/migrate", provider_id, "migrate_instance").await
    }

    async fn get_instance(&self, provider_id: &str) -> OrchestratorResult<ProviderInstance> {
        let request = self
            .client
            .get(self.url("/gpu/instance"))
            .query(&[("instanceId", provider_id)]);
        let response = self.send(request, "get_instance").await?;
        Self::read_json(response, "get_instance").await
    }

    async fn list_instances(&self) -> OrchestratorResult<Vec<ProviderInstance>> {
        let response = self
            .send(self.client.get(self.url("/gpu/instances")), "list_instances")
            .await?;
        let list: ListResponse = Self::read_json(response, "list_instances").await?;
        Ok(list.instances)
    }
}
