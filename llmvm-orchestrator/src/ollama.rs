use std::time::Duration;

use llmvm_common::{Error, Result, RetryPolicy};
use tokio::time::Instant;

/// Client for the Ollama HTTP API on a provisioned instance. Short
/// per-request timeouts keep a dead instance from stalling the caller; the
/// wait helpers own the longer deadline.
pub struct OllamaApi {
    client: reqwest::Client,
    port: u16,
}

impl OllamaApi {
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(OllamaApi { client, port })
    }

    fn base_url(&self, ip: &str) -> String {
        // Strip a CIDR suffix if present ("1.2.3.4/32" -> "1.2.3.4").
        let clean_ip = ip.split('/').next().unwrap_or(ip);
        format!("http://{}:{}", clean_ip, self.port)
    }

    /// One probe of the runtime's root endpoint.
    pub async fn is_serving(&self, ip: &str) -> bool {
        match self.client.get(format!("{}/", self.base_url(ip))).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Names of the models the runtime currently has available.
    pub async fn list_models(&self, ip: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url(ip));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::TransientNetwork(format!(
                "model listing returned HTTP {}",
                resp.status()
            )));
        }
        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::TransientNetwork(e.to_string()))?;
        let mut names = Vec::new();
        if let Some(models) = v["models"].as_array() {
            for model in models {
                if let Some(name) = model["name"].as_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    pub async fn model_available(&self, ip: &str, model: &str) -> bool {
        match self.list_models(ip).await {
            Ok(names) => names.iter().any(|n| n == model || n == &format!("{}:latest", model)),
            Err(e) => {
                tracing::debug!(error = %e, "model listing not reachable yet");
                false
            }
        }
    }

    /// Poll the root endpoint until it answers or the policy deadline
    /// passes. Returns whether the runtime came up.
    pub async fn wait_serving(&self, ip: &str, policy: &RetryPolicy) -> bool {
        let deadline = Instant::now() + policy.timeout;
        loop {
            if self.is_serving(ip).await {
                return true;
            }
            if Instant::now() + policy.interval >= deadline {
                return false;
            }
            tracing::debug!(ip, "inference runtime not serving yet");
            tokio::time::sleep(policy.interval).await;
        }
    }

    /// Poll the model listing until `model` shows up or the deadline passes.
    pub async fn wait_model(&self, ip: &str, model: &str, policy: &RetryPolicy) -> bool {
        let deadline = Instant::now() + policy.timeout;
        loop {
            if self.model_available(ip, model).await {
                return true;
            }
            if Instant::now() + policy.interval >= deadline {
                return false;
            }
            tracing::debug!(ip, model, "model not listed yet");
            tokio::time::sleep(policy.interval).await;
        }
    }
}
