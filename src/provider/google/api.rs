//! Thin REST client for the Compute Engine v1 API.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::provider::operation::{Operation, OperationSource};
use crate::provider::{ProviderError, ProviderFuture};

use super::auth::TokenSource;
use super::types::{ApiErrorEnvelope, GceInstance, GceOperation, InsertInstanceBody, MetadataBody};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const COMPUTE_API_BASE: &str = "https://www.googleapis.com/compute/v1";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Authenticated access to one Compute Engine project.
#[derive(Debug)]
pub(crate) struct GoogleApi {
    tokens: TokenSource,
    base_url: String,
}

impl GoogleApi {
    pub(crate) fn new(tokens: TokenSource) -> Self {
        Self {
            tokens,
            base_url: COMPUTE_API_BASE.to_owned(),
        }
    }

    pub(crate) fn project_id(&self) -> &str {
        self.tokens.project_id()
    }

    fn zone_url(&self, zone: &str, resource: &str) -> String {
        format!(
            "{}/projects/{}/zones/{zone}/{resource}",
            self.base_url,
            self.project_id()
        )
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ProviderError> {
        let token = self.tokens.token(&HTTP_CLIENT).await?;
        debug!(%method, %url, "compute api request");
        let mut request = HTTP_CLIENT.request(method, url).bearer_auth(token);
        if let Some(payload) = body {
            request = request.json(&payload);
        }
        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(error_from_response(status, url, &text));
        }
        serde_json::from_str(&text).map_err(|err| ProviderError::Decode(format!("{url}: {err}")))
    }

    pub(crate) async fn insert_instance(
        &self,
        zone: &str,
        body: &InsertInstanceBody,
    ) -> Result<Operation, ProviderError> {
        let payload =
            serde_json::to_value(body).map_err(|err| ProviderError::Decode(err.to_string()))?;
        let operation: GceOperation = self
            .send(Method::POST, &self.zone_url(zone, "instances"), Some(payload))
            .await?;
        Ok(operation.into())
    }

    pub(crate) async fn get_instance(
        &self,
        zone: &str,
        name: &str,
    ) -> Result<GceInstance, ProviderError> {
        self.send(
            Method::GET,
            &self.zone_url(zone, &format!("instances/{name}")),
            None,
        )
        .await
    }

    pub(crate) async fn delete_instance(
        &self,
        zone: &str,
        name: &str,
    ) -> Result<Operation, ProviderError> {
        let operation: GceOperation = self
            .send(
                Method::DELETE,
                &self.zone_url(zone, &format!("instances/{name}")),
                None,
            )
            .await?;
        Ok(operation.into())
    }

    pub(crate) async fn delete_disk(&self, zone: &str, name: &str) -> Result<Operation, ProviderError> {
        let operation: GceOperation = self
            .send(
                Method::DELETE,
                &self.zone_url(zone, &format!("disks/{name}")),
                None,
            )
            .await?;
        Ok(operation.into())
    }

    pub(crate) async fn set_metadata(
        &self,
        zone: &str,
        name: &str,
        metadata: &MetadataBody,
    ) -> Result<Operation, ProviderError> {
        let payload =
            serde_json::to_value(metadata).map_err(|err| ProviderError::Decode(err.to_string()))?;
        let operation: GceOperation = self
            .send(
                Method::POST,
                &self.zone_url(zone, &format!("instances/{name}/setMetadata")),
                Some(payload),
            )
            .await?;
        Ok(operation.into())
    }

    pub(crate) async fn get_operation(
        &self,
        zone: &str,
        name: &str,
    ) -> Result<Operation, ProviderError> {
        let operation: GceOperation = self
            .send(
                Method::GET,
                &self.zone_url(zone, &format!("operations/{name}")),
                None,
            )
            .await?;
        Ok(operation.into())
    }
}

/// Polls zone operations for one zone.
pub(crate) struct ZoneOperations<'a> {
    pub(crate) api: &'a GoogleApi,
    pub(crate) zone: &'a str,
}

impl OperationSource for ZoneOperations<'_> {
    fn check<'a>(&'a self, operation: &'a Operation) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let zone = operation.zone.as_deref().unwrap_or(self.zone);
            self.api.get_operation(zone, &operation.name).await
        })
    }
}

/// Maps an unsuccessful response to a provider error, keeping 404 distinct.
pub(crate) fn error_from_response(status: StatusCode, url: &str, body: &str) -> ProviderError {
    if status == StatusCode::NOT_FOUND {
        return ProviderError::NotFound {
            resource: url.to_owned(),
        };
    }
    let message = serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .ok()
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| body.trim().to_owned());
    ProviderError::Api {
        code: status.as_u16(),
        message,
    }
}
