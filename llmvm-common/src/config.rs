use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::{parse_zone_priority, InstanceSpec, RetryPolicy};

fn default_provider() -> String {
    "gcp".to_string()
}

fn default_api_base() -> String {
    "https://compute.googleapis.com/compute/v1".to_string()
}

fn default_access_token_env() -> String {
    "GCP_ACCESS_TOKEN".to_string()
}

fn default_machine_type() -> String {
    "n1-standard-4".to_string()
}

fn default_image_family() -> String {
    "ubuntu-2204-lts".to_string()
}

fn default_disk_size_gb() -> u32 {
    30
}

fn default_ollama_port() -> u16 {
    11434
}

fn default_max_attempts() -> u32 {
    5
}

fn default_interval_secs() -> u64 {
    10
}

fn default_timeout_secs() -> u64 {
    300
}

/// Validated configuration handed to the core by the caller. Each component
/// receives the values it needs at construction; nothing reads this from
/// ambient/global state.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub log_level: Option<String>,
    pub my_ip_url: String,
    pub llm_model: String,
    #[serde(default = "default_ollama_port")]
    pub ollama_port: u16,
    pub gcp: GcpConfig,
    pub ssh: SshConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcpConfig {
    pub project_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    pub instance_name: String,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    #[serde(default = "default_image_family")]
    pub image_family: String,
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: u32,
    pub gpu_accelerator: Option<String>,
    pub zone_priority: String,
    pub firewall_rule_name: String,
    pub firewall_tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub user: String,
    pub private_key: PathBuf,
    pub public_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl Config {
    /// Reject configurations the core cannot act on. Runs before any
    /// component is constructed so bad input never reaches a provider call.
    pub fn validate(&self) -> Result<()> {
        if self.provider != "gcp" && self.provider != "mock" {
            return Err(Error::Config(format!(
                "unknown provider '{}' (expected 'gcp' or 'mock')",
                self.provider
            )));
        }
        if self.my_ip_url.trim().is_empty() {
            return Err(Error::Config("my_ip_url must be set".into()));
        }
        if self.llm_model.trim().is_empty() {
            return Err(Error::Config("llm_model must be set".into()));
        }
        if self.gcp.project_id.trim().is_empty() {
            return Err(Error::Config("gcp.project_id must be set".into()));
        }
        if self.gcp.instance_name.trim().is_empty() {
            return Err(Error::Config("gcp.instance_name must be set".into()));
        }
        if self.gcp.firewall_rule_name.trim().is_empty() {
            return Err(Error::Config("gcp.firewall_rule_name must be set".into()));
        }
        if self.gcp.firewall_tag.trim().is_empty() {
            return Err(Error::Config("gcp.firewall_tag must be set".into()));
        }
        if self.ssh.user.trim().is_empty() {
            return Err(Error::Config("ssh.user must be set".into()));
        }
        parse_zone_priority(&self.gcp.zone_priority)?;
        self.retry.policy().validate()?;
        Ok(())
    }

    /// Build the immutable per-invocation spec, applying CLI overrides.
    /// The SSH public key is read here so provider implementations only see
    /// ready-to-use material.
    pub fn instance_spec(
        &self,
        name_override: Option<&str>,
        model_override: Option<&str>,
    ) -> Result<InstanceSpec> {
        let ssh_public_key = match &self.ssh.public_key {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!(
                    "cannot read ssh public key '{}': {}",
                    path.display(),
                    e
                ))
            })?),
            None => None,
        };
        Ok(InstanceSpec {
            name: name_override.unwrap_or(&self.gcp.instance_name).to_string(),
            machine_type: self.gcp.machine_type.clone(),
            image_family: self.gcp.image_family.clone(),
            disk_size_gb: self.gcp.disk_size_gb,
            gpu_accelerator: self.gcp.gpu_accelerator.clone(),
            zone_groups: parse_zone_priority(&self.gcp.zone_priority)?,
            firewall_tag: self.gcp.firewall_tag.clone(),
            model: model_override.unwrap_or(&self.llm_model).to_string(),
            ssh_user: self.ssh.user.clone(),
            ssh_public_key: ssh_public_key.map(|k| k.trim().to_string()),
        })
    }
}
