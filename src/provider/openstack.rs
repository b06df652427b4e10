// OpenStack compute adapter
//
// Speaks the small slice of the compute API the lifecycle needs: create,
// action endpoints (os-start, os-stop, shelve, unshelve, rebuild), status
// polls and deletes. HTTP 404 maps to NotFound, connection-level failures
// to Unavailable, any other non-success to Rejected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ProviderConfig;
use crate::errors::ProviderError;
use crate::types::{InstanceId, ResourceSpec};

use super::{ComputeProvider, InstanceStatus, ProviderOp};

pub struct OpenStackProvider {
    http: reqwest::Client,
    compute_url: String,
    auth_token: String,
}

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    server: CreateServer<'a>,
}

#[derive(Serialize)]
struct CreateServer<'a> {
    name: &'a str,
    #[serde(rename = "imageRef")]
    image_ref: &'a str,
    #[serde(rename = "flavorRef")]
    flavor_ref: &'a str,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerBody,
}

#[derive(Deserialize)]
struct ServerBody {
    id: String,
    #[serde(default)]
    status: String,
}

impl OpenStackProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("cannot build http client: {e}")))?;
        Ok(Self {
            http,
            compute_url: config.compute_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.compute_url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        instance: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = request
            .header("X-Auth-Token", &self.auth_token)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(instance.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(ProviderError::Rejected(format!("HTTP {status}: {snippet}")));
        }
        Ok(response)
    }
}

fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::Unavailable(e.to_string())
    } else {
        ProviderError::Rejected(e.to_string())
    }
}

fn map_status(raw: &str) -> InstanceStatus {
    match raw {
        "ACTIVE" => InstanceStatus::Active,
        "SHUTOFF" => InstanceStatus::Stopped,
        "SHELVED" | "SHELVED_OFFLOADED" => InstanceStatus::Shelved,
        "ERROR" => InstanceStatus::Error,
        // BUILD, REBUILD, task-transition states and anything unrecognized
        // count as still settling.
        _ => InstanceStatus::Building,
    }
}

#[async_trait]
impl ComputeProvider for OpenStackProvider {
    async fn provision(&self, spec: &ResourceSpec) -> Result<InstanceId, ProviderError> {
        let body = CreateServerRequest {
            server: CreateServer {
                name: "sandbox",
                image_ref: &spec.image,
                flavor_ref: &spec.flavor,
            },
        };
        let response = self
            .send(self.http.post(self.url("/servers")).json(&body), "<new>")
            .await?;
        let envelope: ServerEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("malformed create response: {e}")))?;
        tracing::info!(instance_id = %envelope.server.id, "instance provisioning accepted");
        Ok(InstanceId::new(envelope.server.id))
    }

    async fn submit(&self, instance: &InstanceId, op: ProviderOp) -> Result<(), ProviderError> {
        if let ProviderOp::Delete = op {
            let url = self.url(&format!("/servers/{instance}"));
            self.send(self.http.delete(url), instance.as_str()).await?;
            return Ok(());
        }

        let body = match &op {
            ProviderOp::Start => json!({ "os-start": null }),
            ProviderOp::Stop => json!({ "os-stop": null }),
            ProviderOp::Shelve => json!({ "shelve": null }),
            ProviderOp::Unshelve => json!({ "unshelve": null }),
            ProviderOp::Rebuild { image } => json!({ "rebuild": { "imageRef": image } }),
            ProviderOp::Delete => unreachable!(),
        };

        let url = self.url(&format!("/servers/{instance}/action"));
        self.send(self.http.post(url).json(&body), instance.as_str())
            .await?;
        tracing::debug!(instance_id = %instance, op = op.as_str(), "operation accepted");
        Ok(())
    }

    async fn poll_status(&self, instance: &InstanceId) -> Result<InstanceStatus, ProviderError> {
        let url = self.url(&format!("/servers/{instance}"));
        let response = self.send(self.http.get(url), instance.as_str()).await?;
        let envelope: ServerEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("malformed server response: {e}")))?;
        Ok(map_status(&envelope.server.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_statuses_map_onto_the_lifecycle_view() {
        assert_eq!(map_status("ACTIVE"), InstanceStatus::Active);
        assert_eq!(map_status("SHUTOFF"), InstanceStatus::Stopped);
        assert_eq!(map_status("SHELVED"), InstanceStatus::Shelved);
        assert_eq!(map_status("SHELVED_OFFLOADED"), InstanceStatus::Shelved);
        assert_eq!(map_status("ERROR"), InstanceStatus::Error);
        assert_eq!(map_status("BUILD"), InstanceStatus::Building);
        assert_eq!(map_status("VERIFY_RESIZE"), InstanceStatus::Building);
    }
}
