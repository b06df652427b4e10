//! Remote-access broker integration.
//!
//! Sandbox users reach their VM through a remote-desktop broker. The
//! lifecycle only needs two capabilities: create a connection for an ACTIVE
//! VM, and tear a VM's connections down when it stops being reachable
//! (shelving or deletion). The controller enforces the ACTIVE-only rule;
//! this module talks to the broker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::BrokerConfig;
use crate::types::{VmId, VmRecord};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker authentication failed: {0}")]
    Auth(String),

    #[error("broker request failed: {0}")]
    Request(String),
}

/// Connection handle returned to the route layer for an ACTIVE VM.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDescriptor {
    pub connection_id: String,
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
}

#[async_trait]
pub trait AccessBroker: Send + Sync {
    /// Provision a remote-desktop connection for the VM.
    async fn create_connection(&self, vm: &VmRecord) -> Result<ConnectionDescriptor, BrokerError>;

    /// Revoke every connection the broker holds for the VM.
    async fn revoke_connections(&self, vm: &VmRecord) -> Result<(), BrokerError>;
}

/// Guacamole-style REST broker client.
pub struct HttpBroker {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    rdp_port: u16,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
    #[serde(rename = "dataSource")]
    data_source: String,
}

#[derive(Deserialize)]
struct ConnectionEntry {
    name: String,
}

fn connection_name(vm_id: VmId) -> String {
    format!("rdp-{vm_id}")
}

impl HttpBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BrokerError::Request(format!("cannot build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            rdp_port: config.rdp_port,
        })
    }

    async fn authenticate(&self) -> Result<AuthResponse, BrokerError> {
        let response = self
            .http
            .post(format!("{}/api/tokens", self.base_url))
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(|e| BrokerError::Auth(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BrokerError::Auth(format!("HTTP {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| BrokerError::Auth(format!("malformed token response: {e}")))
    }

    async fn list_connections(
        &self,
        auth: &AuthResponse,
    ) -> Result<std::collections::HashMap<String, ConnectionEntry>, BrokerError> {
        let url = format!(
            "{}/api/session/data/{}/connections?token={}",
            self.base_url, auth.data_source, auth.auth_token
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BrokerError::Request(format!("HTTP {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| BrokerError::Request(format!("malformed connection list: {e}")))
    }
}

#[async_trait]
impl AccessBroker for HttpBroker {
    async fn create_connection(&self, vm: &VmRecord) -> Result<ConnectionDescriptor, BrokerError> {
        let instance = vm
            .instance_id
            .as_ref()
            .ok_or_else(|| BrokerError::Request("vm has no instance".to_string()))?;
        let auth = self.authenticate().await?;
        let name = connection_name(vm.id);

        let body = json!({
            "name": name,
            "protocol": "rdp",
            "parameters": {
                "hostname": instance.as_str(),
                "port": self.rdp_port.to_string(),
            },
            "attributes": {}
        });

        let url = format!(
            "{}/api/session/data/{}/connections?token={}",
            self.base_url, auth.data_source, auth.auth_token
        );
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BrokerError::Request(format!("HTTP {}", response.status())));
        }

        tracing::info!(vm_id = %vm.id, connection = %name, "remote-access connection created");
        Ok(ConnectionDescriptor {
            connection_id: name,
            protocol: "rdp".to_string(),
            hostname: instance.as_str().to_string(),
            port: self.rdp_port,
        })
    }

    async fn revoke_connections(&self, vm: &VmRecord) -> Result<(), BrokerError> {
        let auth = self.authenticate().await?;
        let name = connection_name(vm.id);
        let connections = self.list_connections(&auth).await?;

        for (connection_id, entry) in connections {
            if entry.name != name {
                continue;
            }
            let url = format!(
                "{}/api/session/data/{}/connections/{}?token={}",
                self.base_url, auth.data_source, connection_id, auth.auth_token
            );
            let response = self
                .http
                .delete(url)
                .send()
                .await
                .map_err(|e| BrokerError::Request(e.to_string()))?;
            if !response.status().is_success() {
                return Err(BrokerError::Request(format!("HTTP {}", response.status())));
            }
            tracing::info!(vm_id = %vm.id, connection = %connection_id, "remote-access connection revoked");
        }

        Ok(())
    }
}
