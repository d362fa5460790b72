//! Provisioning worker client: an optional collaborator. The worker itself
//! is out of scope as a program; this module is the daemon-side client for
//! its two POST endpoints, modeled as a trait so the daemon never
//! hard-depends on a specific worker deployment.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct TunnelRequest {
    #[serde(rename = "machineId")]
    pub machine_id: String,
    #[serde(rename = "publicKeyJWK")]
    pub public_key_jwk: serde_json::Value,
    pub signature: String,
    pub challenge: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelResponse {
    pub success: bool,
    #[serde(rename = "tunnelToken")]
    pub tunnel_token: Option<String>,
    pub subdomain: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomizeRequest {
    #[serde(rename = "machineId")]
    pub machine_id: String,
    #[serde(rename = "newSubdomain")]
    pub new_subdomain: String,
    pub signature: String,
    pub challenge: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomizeResponse {
    pub success: bool,
}

/// Signs `"<machineId>:<challenge>:<timestamp>"` (or the customize variant)
/// with ECDSA-P-256/SHA-256, base64-encoded.
pub fn sign_request(signing_key: &SigningKey, message: &str) -> String {
    let signature: Signature = signing_key.sign(message.as_bytes());
    STANDARD.encode(signature.to_bytes())
}

/// A fixed reserved set of subdomains the worker refuses.
pub const RESERVED_SUBDOMAINS: &[&str] = &["www", "api", "admin", "app", "mail", "root", "status"];

/// Validates a requested subdomain against the allowed pattern and reserved
/// set before a `customize` call is even attempted.
pub fn is_valid_subdomain(candidate: &str) -> bool {
    if RESERVED_SUBDOMAINS.contains(&candidate) {
        return false;
    }
    let bytes = candidate.as_bytes();
    if bytes.len() < 3 || bytes.len() > 32 {
        return false;
    }
    let is_alnum_or_dash = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-';
    let first_last_ok =
        |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    bytes.iter().all(|&b| is_alnum_or_dash(b))
        && first_last_ok(bytes[0])
        && first_last_ok(bytes[bytes.len() - 1])
}

#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn request_tunnel(&self, request: TunnelRequest) -> Result<TunnelResponse>;
    async fn customize(&self, request: CustomizeRequest) -> Result<CustomizeResponse>;
}

/// Plain HTTP implementation against a worker base URL.
pub struct HttpProvisioningClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpProvisioningClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn request_tunnel(&self, request: TunnelRequest) -> Result<TunnelResponse> {
        let url = format!("{}/api/v1/tunnel/request", self.base_url);
        let resp = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::Other(e.into()))?;
        resp.json().await.map_err(|e| BridgeError::Other(e.into()))
    }

    async fn customize(&self, request: CustomizeRequest) -> Result<CustomizeResponse> {
        let url = format!("{}/api/v1/tunnel/customize", self.base_url);
        let resp = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::Other(e.into()))?;
        resp.json().await.map_err(|e| BridgeError::Other(e.into()))
    }
}
