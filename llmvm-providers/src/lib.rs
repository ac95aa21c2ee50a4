use async_trait::async_trait;

use llmvm_common::{FirewallRule, InstanceRecord, InstanceSpec, Result};

/// Capability interface over a cloud provider's compute API. One
/// implementation per provider, selected by configuration.
///
/// Every mutating call blocks (bounded polling) until the provider reports a
/// terminal status for that call: `create`/`start` return once the instance
/// reaches RUNNING, `stop` once it reaches STOPPED, `delete` once the
/// instance is gone. That is the API-level steady state, not readiness of
/// software inside the instance.
///
/// Implementations must be safe for concurrent use across distinct instance
/// names; no per-call global state.
#[async_trait]
pub trait CloudCompute: Send + Sync {
    /// Look up an instance by name across all zones of the project.
    /// Returns `Error::NotFound` when no such instance exists.
    async fn get(&self, name: &str) -> Result<InstanceRecord>;

    /// Create an instance in the given zone and wait for RUNNING.
    /// Zone capacity and quota failures surface as `Error::QuotaExceeded`.
    async fn create(&self, spec: &InstanceSpec, zone: &str) -> Result<InstanceRecord>;

    async fn start(&self, name: &str, zone: &str) -> Result<()>;

    async fn stop(&self, name: &str, zone: &str) -> Result<()>;

    async fn delete(&self, name: &str, zone: &str) -> Result<()>;

    /// All instances visible to the configured project, empty if none.
    async fn list(&self) -> Result<Vec<InstanceRecord>>;

    /// Known zone names in provider-returned order, used for wildcard
    /// expansion of zone priority groups.
    async fn list_zones(&self) -> Result<Vec<String>>;

    /// Returns `Error::NotFound` when no rule with that name exists.
    async fn get_firewall_rule(&self, name: &str) -> Result<FirewallRule>;

    /// Create the rule, or update it in place when one with the same name
    /// already exists with a different source range. Idempotent.
    async fn ensure_firewall_rule(&self, rule: &FirewallRule) -> Result<FirewallRule>;
}

#[cfg(feature = "gcp")]
pub mod gcp;

#[cfg(feature = "mock")]
pub mod mock;
