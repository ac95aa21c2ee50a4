use std::sync::Arc;

use llmvm_common::{
    Error, InstanceRecord, InstanceSpec, InstanceStatus, ProvisioningResult, Result, RetryPolicy,
};
use llmvm_providers::CloudCompute;

use crate::firewall::FirewallManager;
use crate::provision::RemoteProvisioner;
use crate::retry;

/// What `create` actually did.
#[derive(Debug)]
pub enum CreateOutcome {
    /// The instance already existed; nothing was created or provisioned.
    AlreadyExists(InstanceRecord),
    /// A new instance was placed, firewalled and provisioned.
    Provisioned(ProvisioningResult),
}

/// State machine over instance lifecycle operations. The cloud provider is
/// the source of truth: every transition re-queries live status immediately
/// before acting, because state can change out-of-band between calls.
///
/// One logical operation per invocation; two concurrent invocations against
/// the same instance name race on the provider's own concurrency control —
/// this manager provides no cross-process locking.
pub struct LifecycleManager {
    compute: Arc<dyn CloudCompute>,
    firewall: FirewallManager,
    provisioner: RemoteProvisioner,
    policy: RetryPolicy,
}

impl LifecycleManager {
    pub fn new(
        compute: Arc<dyn CloudCompute>,
        firewall: FirewallManager,
        provisioner: RemoteProvisioner,
        policy: RetryPolicy,
    ) -> Self {
        LifecycleManager {
            compute,
            firewall,
            provisioner,
            policy,
        }
    }

    /// Create, firewall and provision an instance.
    ///
    /// Idempotent on the name: when the instance already exists this is a
    /// warning-level no-op returning the existing record, never a duplicate
    /// and never an error.
    ///
    /// There is deliberately no rollback when provisioning fails after the
    /// instance was created: the instance is left RUNNING but unprovisioned
    /// and the error says so. Delete it and re-create, or finish the setup
    /// by hand.
    pub async fn create(&self, spec: &InstanceSpec) -> Result<CreateOutcome> {
        match self.compute.get(&spec.name).await {
            Ok(existing) => {
                tracing::warn!(
                    instance = %spec.name,
                    zone = existing.zone.as_deref().unwrap_or("unknown"),
                    status = %existing.status,
                    "instance already exists, not creating a new one"
                );
                return Ok(CreateOutcome::AlreadyExists(existing));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let record = crate::zones::place(self.compute.as_ref(), spec, &self.policy).await?;

        self.firewall.ensure(&spec.firewall_tag).await?;

        let result = self.provisioner.provision(&record, &spec.model).await?;
        Ok(CreateOutcome::Provisioned(result))
    }

    /// Start a stopped instance. Fails with `NotFound` when the instance
    /// does not exist; already-running is an idempotent no-op. Returns the
    /// freshly queried record — the external IP may differ from before the
    /// stop.
    pub async fn start(&self, name: &str) -> Result<InstanceRecord> {
        let record = self.get_or_not_found(name, "start").await?;
        match record.status {
            InstanceStatus::Running => {
                tracing::warn!(instance = name, "instance is already running");
                Ok(record)
            }
            InstanceStatus::Stopped => {
                let zone = zone_of(&record)?;
                let compute = &self.compute;
                let zone_ref = zone.as_str();
                retry::run(&self.policy, move || compute.start(name, zone_ref)).await?;
                let fresh = self.compute.get(name).await?;
                tracing::info!(
                    instance = name,
                    ip = fresh.external_ip.as_deref().unwrap_or("none"),
                    "instance started"
                );
                Ok(fresh)
            }
            other => Err(Error::Provider(format!(
                "instance '{}' is {}, cannot start",
                name, other
            ))),
        }
    }

    /// Stop a running instance. Fails with `NotFound` when the instance does
    /// not exist; already-stopped is an idempotent no-op.
    pub async fn stop(&self, name: &str) -> Result<InstanceRecord> {
        let record = self.get_or_not_found(name, "stop").await?;
        match record.status {
            InstanceStatus::Stopped => {
                tracing::warn!(instance = name, "instance is already stopped");
                Ok(record)
            }
            InstanceStatus::Running => {
                let zone = zone_of(&record)?;
                let compute = &self.compute;
                let zone_ref = zone.as_str();
                retry::run(&self.policy, move || compute.stop(name, zone_ref)).await?;
                tracing::info!(instance = name, "instance stopped");
                self.compute.get(name).await
            }
            other => Err(Error::Provider(format!(
                "instance '{}' is {}, cannot stop",
                name, other
            ))),
        }
    }

    /// Delete an instance in any state. Deleting a nonexistent instance is
    /// an idempotent no-op — the desired end state is already true.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let record = match self.compute.get(name).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                tracing::warn!(instance = name, "instance does not exist, nothing to delete");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let zone = zone_of(&record)?;
        let compute = &self.compute;
        let zone_ref = zone.as_str();
        retry::run(&self.policy, move || compute.delete(name, zone_ref)).await?;
        tracing::info!(instance = name, zone = %zone, "instance deleted");
        Ok(())
    }

    /// All instances visible to the configured project.
    pub async fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.compute.list().await
    }

    async fn get_or_not_found(&self, name: &str, operation: &str) -> Result<InstanceRecord> {
        self.compute.get(name).await.map_err(|e| {
            if e.is_not_found() {
                Error::NotFound(format!(
                    "instance '{}' does not exist, cannot {}",
                    name, operation
                ))
            } else {
                e
            }
        })
    }
}

fn zone_of(record: &InstanceRecord) -> Result<String> {
    record
        .zone
        .clone()
        .ok_or_else(|| Error::Provider(format!("instance '{}' reports no zone", record.name)))
}
