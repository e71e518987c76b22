//! External sandbox collaborators.
//!
//! The core treats the remote compute side as opaque: a directory that knows
//! which execution endpoints are reachable and what resources they carry,
//! and an executor that runs approved code and reports success plus output.
//! Agnostic seams — bring your own sandbox provider.

use crate::crypto::PayloadCipher;
use crate::error::ResourceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A reachable remote execution endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEndpoint {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub repository: Option<String>,
}

/// What an endpoint has available: installed packages and accessible secret
/// names (never secret values).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// Supplies reachable execution endpoints for a session scope.
#[async_trait]
pub trait SandboxDirectory: Send + Sync {
    async fn list_active_endpoints(
        &self,
        session_scope: &str,
    ) -> Result<Vec<SandboxEndpoint>, ResourceError>;

    async fn fetch_resources(&self, endpoint_url: &str)
    -> Result<ResourceDescriptor, ResourceError>;
}

/// One dispatch of approved code to a sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub confidentiality_requested: bool,
}

/// What came back from the sandbox. The core only inspects `success` and the
/// payload bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub stderr: String,
}

/// Runs approved code on a sandbox endpoint.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn run(
        &self,
        endpoint: &SandboxEndpoint,
        request: ExecutionRequest,
    ) -> anyhow::Result<ExecutionResult>;
}

// ─── HTTP implementations ───────────────────────────────────────────────────

/// Directory backed by the sandbox provider's HTTP API.
pub struct HttpSandboxDirectory {
    client: reqwest::Client,
    api_base: String,
}

impl HttpSandboxDirectory {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl SandboxDirectory for HttpSandboxDirectory {
    async fn list_active_endpoints(
        &self,
        session_scope: &str,
    ) -> Result<Vec<SandboxEndpoint>, ResourceError> {
        let url = format!("{}/endpoints", self.api_base.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("scope", session_scope)])
            .send()
            .await
            .map_err(|e| ResourceError::Lookup(format!("list endpoints: {e}")))?;

        if !response.status().is_success() {
            return Err(ResourceError::Lookup(format!(
                "list endpoints: HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Vec<SandboxEndpoint>>()
            .await
            .map_err(|e| ResourceError::Lookup(format!("decode endpoint list: {e}")))
    }

    async fn fetch_resources(
        &self,
        endpoint_url: &str,
    ) -> Result<ResourceDescriptor, ResourceError> {
        let url = format!("{}/resources", endpoint_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ResourceError::Lookup(format!("fetch resources: {e}")))?;

        if !response.status().is_success() {
            return Err(ResourceError::Lookup(format!(
                "fetch resources: HTTP {}",
                response.status()
            )));
        }

        response
            .json::<ResourceDescriptor>()
            .await
            .map_err(|e| ResourceError::Lookup(format!("decode resource descriptor: {e}")))
    }
}

/// Executor POSTing `{code, confidential}` to the endpoint's execute route.
/// With a cipher configured, code is encrypted before it leaves the process
/// and output is decrypted on the way back.
pub struct HttpSandboxExecutor {
    client: reqwest::Client,
    cipher: Option<PayloadCipher>,
}

impl HttpSandboxExecutor {
    pub fn new(cipher: Option<PayloadCipher>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cipher,
        }
    }
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    code: &'a str,
    confidential: bool,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    output: String,
    #[serde(default)]
    stderr: String,
}

#[async_trait]
impl SandboxExecutor for HttpSandboxExecutor {
    async fn run(
        &self,
        endpoint: &SandboxEndpoint,
        request: ExecutionRequest,
    ) -> anyhow::Result<ExecutionResult> {
        let confidential = request.confidentiality_requested && self.cipher.is_some();
        let code = match (&self.cipher, confidential) {
            (Some(cipher), true) => cipher.encrypt(request.code.as_bytes()),
            _ => request.code.clone(),
        };

        let url = format!("{}/execute", endpoint.url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&ExecuteBody {
                code: &code,
                confidential,
            })
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("dispatch to sandbox {}: {e}", endpoint.id))?;

        if !response.status().is_success() {
            anyhow::bail!("sandbox {} returned HTTP {}", endpoint.id, response.status());
        }

        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("decode sandbox response: {e}"))?;

        let output = match (&self.cipher, confidential) {
            (Some(cipher), true) => cipher
                .decrypt_str(&body.output)
                .map_err(|e| anyhow::anyhow!("decrypt sandbox output: {e}"))?,
            _ => body.output,
        };

        Ok(ExecutionResult {
            success: body.success,
            output,
            stderr: body.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_deserializes_without_repository() {
        let endpoint: SandboxEndpoint =
            serde_json::from_str(r#"{"id": "sb-1", "url": "https://sb-1.example"}"#).unwrap();
        assert_eq!(endpoint.id, "sb-1");
        assert!(endpoint.repository.is_none());
    }

    #[test]
    fn resource_descriptor_defaults_to_empty() {
        let descriptor: ResourceDescriptor = serde_json::from_str("{}").unwrap();
        assert!(descriptor.packages.is_empty());
        assert!(descriptor.secrets.is_empty());
    }

    #[test]
    fn execution_result_tolerates_missing_streams() {
        let result: ExecutionResult = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(result.success);
        assert!(result.output.is_empty());
    }
}
