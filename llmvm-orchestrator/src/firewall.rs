use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use llmvm_common::{Error, FirewallRule, Result, RetryPolicy};
use llmvm_providers::CloudCompute;

use crate::retry;

/// Keeps the runtime's firewall rule scoped to the caller's current public
/// IP. The rule is only ever narrowed or moved, never broadened: there is no
/// 0.0.0.0/0 fallback when discovery fails.
pub struct FirewallManager {
    compute: Arc<dyn CloudCompute>,
    http: reqwest::Client,
    my_ip_url: String,
    rule_name: String,
    port: u16,
    policy: RetryPolicy,
}

impl FirewallManager {
    pub fn new(
        compute: Arc<dyn CloudCompute>,
        my_ip_url: String,
        rule_name: String,
        port: u16,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(FirewallManager {
            compute,
            http,
            my_ip_url,
            rule_name,
            port,
            policy,
        })
    }

    /// Caller's public IP as seen by the discovery endpoint (plain-text
    /// body), retried per policy.
    pub async fn discover_public_ip(&self) -> Result<IpAddr> {
        let http = &self.http;
        let url = self.my_ip_url.as_str();
        retry::run(&self.policy, move || async move {
            let resp = http
                .get(url)
                .send()
                .await
                .map_err(|e| Error::TransientNetwork(format!("ip discovery failed: {}", e)))?;
            if !resp.status().is_success() {
                return Err(Error::TransientNetwork(format!(
                    "ip discovery returned HTTP {}",
                    resp.status()
                )));
            }
            let body = resp
                .text()
                .await
                .map_err(|e| Error::TransientNetwork(format!("ip discovery read failed: {}", e)))?;
            body.trim().parse::<IpAddr>().map_err(|e| {
                Error::Provider(format!(
                    "ip discovery endpoint returned '{}', not an IP: {}",
                    body.trim(),
                    e
                ))
            })
        })
        .await
    }

    /// Make sure exactly one rule with the configured name exists and that
    /// it allows only the caller's current IP on the runtime port.
    pub async fn ensure(&self, target_tag: &str) -> Result<FirewallRule> {
        let ip = self.discover_public_ip().await?;
        let desired = FirewallRule {
            name: self.rule_name.clone(),
            target_tag: target_tag.to_string(),
            source_range: format!("{}/32", ip),
            port: self.port,
        };

        match self.compute.get_firewall_rule(&self.rule_name).await {
            Ok(existing) if existing == desired => {
                tracing::debug!(rule = %self.rule_name, source = %desired.source_range, "firewall rule already up to date");
                return Ok(existing);
            }
            Ok(existing) => {
                tracing::info!(
                    rule = %self.rule_name,
                    old_source = %existing.source_range,
                    new_source = %desired.source_range,
                    "caller IP changed, updating firewall rule in place"
                );
            }
            Err(e) if e.is_not_found() => {
                tracing::info!(rule = %self.rule_name, source = %desired.source_range, "creating firewall rule");
            }
            Err(e) => return Err(e),
        }

        let compute = &self.compute;
        let desired_ref = &desired;
        retry::run(&self.policy, move || {
            compute.ensure_firewall_rule(desired_ref)
        })
        .await
    }
}
