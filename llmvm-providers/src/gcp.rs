use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

use llmvm_common::config::GcpConfig;
use llmvm_common::{
    Error, FirewallRule, InstanceRecord, InstanceSpec, InstanceStatus, Result, RetryPolicy,
};

use crate::CloudCompute;

/// GCP Compute Engine v1 REST client. Authenticates with a pre-issued OAuth2
/// bearer token supplied by the caller; token acquisition is out of scope.
pub struct GcpCompute {
    client: Client,
    api_base: String,
    project: String,
    token: String,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl GcpCompute {
    pub fn new(cfg: &GcpConfig, token: String, policy: RetryPolicy) -> Result<Self> {
        // No overall timeout on the default client; a stalled API call would
        // otherwise hang the whole invocation.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(Error::Config("GCP access token is empty".into()));
        }
        Ok(GcpCompute {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            project: cfg.project_id.clone(),
            token,
            poll_interval: policy.interval,
            poll_timeout: policy.timeout,
        })
    }

    fn project_url(&self, suffix: &str) -> String {
        format!("{}/projects/{}/{}", self.api_base, self.project, suffix)
    }

    async fn get_json(&self, url: &str, context: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp, None, context).await);
        }
        resp.json().await.map_err(transport)
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        zone: Option<&str>,
        context: &str,
    ) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp, zone, context).await);
        }
        resp.json().await.map_err(transport)
    }

    async fn get_in_zone(&self, name: &str, zone: &str) -> Result<InstanceRecord> {
        let url = self.project_url(&format!("zones/{}/instances/{}", zone, name));
        let v = self
            .get_json(&url, &format!("instance '{}' in zone {}", name, zone))
            .await?;
        Ok(parse_instance(&v))
    }

    /// Poll a zone operation until DONE; operation-level errors are mapped
    /// into the shared taxonomy (zone capacity and quota both mean "try
    /// another zone").
    async fn wait_zone_operation(&self, zone: &str, op_name: &str) -> Result<()> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            let url = self.project_url(&format!("zones/{}/operations/{}", zone, op_name));
            let v = self
                .get_json(&url, &format!("operation '{}' in zone {}", op_name, zone))
                .await?;
            if v["status"] == "DONE" {
                if let Some(errors) = v["error"]["errors"].as_array() {
                    return Err(operation_error(zone, errors));
                }
                return Ok(());
            }
            if Instant::now() + self.poll_interval >= deadline {
                return Err(Error::TransientNetwork(format!(
                    "timed out waiting for operation '{}' in zone {}",
                    op_name, zone
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_instance_status(
        &self,
        name: &str,
        zone: &str,
        target: InstanceStatus,
    ) -> Result<InstanceRecord> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            let record = self.get_in_zone(name, zone).await?;
            if record.status == target {
                return Ok(record);
            }
            tracing::debug!(
                instance = name,
                zone,
                status = %record.status,
                waiting_for = %target,
                "instance not yet in target state"
            );
            if Instant::now() + self.poll_interval >= deadline {
                return Err(Error::TransientNetwork(format!(
                    "timed out waiting for instance '{}' in zone {} to become {}",
                    name, zone, target
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_instance_gone(&self, name: &str, zone: &str) -> Result<()> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            match self.get_in_zone(name, zone).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
                Ok(record) => {
                    tracing::debug!(instance = name, zone, status = %record.status, "still deleting");
                }
            }
            if Instant::now() + self.poll_interval >= deadline {
                return Err(Error::TransientNetwork(format!(
                    "timed out waiting for instance '{}' in zone {} to be deleted",
                    name, zone
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn build_instance_body(&self, spec: &InstanceSpec, zone: &str) -> serde_json::Value {
        let mut body = json!({
            "name": spec.name,
            "machineType": format!("zones/{}/machineTypes/{}", zone, spec.machine_type),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": format!(
                        "projects/ubuntu-os-cloud/global/images/family/{}",
                        spec.image_family
                    ),
                    "diskSizeGb": spec.disk_size_gb.to_string(),
                }
            }],
            "networkInterfaces": [{
                "network": "global/networks/default",
                "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "name": "External NAT"}]
            }],
            "scheduling": {"onHostMaintenance": "TERMINATE", "automaticRestart": true},
            "tags": {"items": [spec.firewall_tag]},
        });

        let mut metadata_items = Vec::new();
        if let Some(gpu) = &spec.gpu_accelerator {
            body["guestAccelerators"] = json!([{
                "acceleratorType": format!("zones/{}/acceleratorTypes/{}", zone, gpu),
                "acceleratorCount": 1
            }]);
            metadata_items.push(json!({"key": "install-nvidia-driver", "value": "true"}));
        }
        if let Some(key) = &spec.ssh_public_key {
            metadata_items.push(json!({
                "key": "ssh-keys",
                "value": format!("{}:{}", spec.ssh_user, key)
            }));
        }
        if !metadata_items.is_empty() {
            body["metadata"] = json!({"items": metadata_items});
        }
        body
    }
}

#[async_trait]
impl CloudCompute for GcpCompute {
    async fn get(&self, name: &str) -> Result<InstanceRecord> {
        self.list()
            .await?
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::NotFound(format!("instance '{}' not found", name)))
    }

    async fn create(&self, spec: &InstanceSpec, zone: &str) -> Result<InstanceRecord> {
        let url = self.project_url(&format!("zones/{}/instances", zone));
        let body = self.build_instance_body(spec, zone);
        let op = self
            .post_json(
                &url,
                &body,
                Some(zone),
                &format!("create instance '{}' in zone {}", spec.name, zone),
            )
            .await?;
        let op_name = op["name"]
            .as_str()
            .ok_or_else(|| Error::Provider("insert response carried no operation name".into()))?
            .to_string();
        tracing::info!(instance = %spec.name, zone, operation = %op_name, "instance creation started");
        self.wait_zone_operation(zone, &op_name).await?;
        self.wait_instance_status(&spec.name, zone, InstanceStatus::Running)
            .await
    }

    async fn start(&self, name: &str, zone: &str) -> Result<()> {
        let url = self.project_url(&format!("zones/{}/instances/{}/start", zone, name));
        let op = self
            .post_json(
                &url,
                &json!({}),
                Some(zone),
                &format!("start instance '{}' in zone {}", name, zone),
            )
            .await?;
        if let Some(op_name) = op["name"].as_str() {
            self.wait_zone_operation(zone, op_name).await?;
        }
        self.wait_instance_status(name, zone, InstanceStatus::Running)
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str, zone: &str) -> Result<()> {
        let url = self.project_url(&format!("zones/{}/instances/{}/stop", zone, name));
        let op = self
            .post_json(
                &url,
                &json!({}),
                Some(zone),
                &format!("stop instance '{}' in zone {}", name, zone),
            )
            .await?;
        if let Some(op_name) = op["name"].as_str() {
            self.wait_zone_operation(zone, op_name).await?;
        }
        self.wait_instance_status(name, zone, InstanceStatus::Stopped)
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str, zone: &str) -> Result<()> {
        let url = self.project_url(&format!("zones/{}/instances/{}", zone, name));
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(error_from_response(
                resp,
                Some(zone),
                &format!("delete instance '{}' in zone {}", name, zone),
            )
            .await);
        }
        let op: serde_json::Value = resp.json().await.map_err(transport)?;
        if let Some(op_name) = op["name"].as_str() {
            self.wait_zone_operation(zone, op_name).await?;
        }
        self.wait_instance_gone(name, zone).await
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>> {
        let url = self.project_url("aggregated/instances");
        let v = self.get_json(&url, "aggregated instance list").await?;
        let mut records = Vec::new();
        if let Some(items) = v["items"].as_object() {
            for scoped in items.values() {
                if let Some(instances) = scoped["instances"].as_array() {
                    for instance in instances {
                        records.push(parse_instance(instance));
                    }
                }
            }
        }
        Ok(records)
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        let url = self.project_url("zones");
        let v = self.get_json(&url, "zone list").await?;
        let mut zones = Vec::new();
        if let Some(items) = v["items"].as_array() {
            for item in items {
                if let Some(name) = item["name"].as_str() {
                    zones.push(name.to_string());
                }
            }
        }
        Ok(zones)
    }

    async fn get_firewall_rule(&self, name: &str) -> Result<FirewallRule> {
        let url = self.project_url(&format!("global/firewalls/{}", name));
        let v = self
            .get_json(&url, &format!("firewall rule '{}'", name))
            .await?;
        parse_firewall_rule(&v)
            .ok_or_else(|| Error::Provider(format!("firewall rule '{}' has unexpected shape", name)))
    }

    async fn ensure_firewall_rule(&self, rule: &FirewallRule) -> Result<FirewallRule> {
        let body = json!({
            "name": rule.name,
            "network": "global/networks/default",
            "direction": "INGRESS",
            "sourceRanges": [rule.source_range],
            "targetTags": [rule.target_tag],
            "allowed": [{"IPProtocol": "tcp", "ports": [rule.port.to_string()]}],
        });
        match self.get_firewall_rule(&rule.name).await {
            Ok(existing) => {
                if existing == *rule {
                    return Ok(existing);
                }
                // Update in place; a rule name maps to exactly one rule.
                let url = self.project_url(&format!("global/firewalls/{}", rule.name));
                let resp = self
                    .client
                    .patch(&url)
                    .bearer_auth(&self.token)
                    .json(&body)
                    .send()
                    .await
                    .map_err(transport)?;
                if !resp.status().is_success() {
                    return Err(error_from_response(
                        resp,
                        None,
                        &format!("update firewall rule '{}'", rule.name),
                    )
                    .await);
                }
                tracing::info!(rule = %rule.name, source = %rule.source_range, "firewall rule updated");
                Ok(rule.clone())
            }
            Err(e) if e.is_not_found() => {
                let url = self.project_url("global/firewalls");
                self.post_json(&url, &body, None, &format!("create firewall rule '{}'", rule.name))
                    .await?;
                tracing::info!(rule = %rule.name, source = %rule.source_range, "firewall rule created");
                Ok(rule.clone())
            }
            Err(e) => Err(e),
        }
    }
}

fn transport(err: reqwest::Error) -> Error {
    Error::TransientNetwork(err.to_string())
}

fn truncate(body: &str) -> String {
    body.chars().take(300).collect()
}

fn is_capacity_error(body: &str) -> bool {
    body.contains("QUOTA_EXCEEDED")
        || body.contains("quotaExceeded")
        || body.contains("ZONE_RESOURCE_POOL_EXHAUSTED")
        || body.contains("resourcePoolExhausted")
}

async fn error_from_response(
    resp: reqwest::Response,
    zone: Option<&str>,
    context: &str,
) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    classify_http(status, &body, zone, context)
}

fn classify_http(status: u16, body: &str, zone: Option<&str>, context: &str) -> Error {
    match status {
        401 => Error::Auth(format!("{}: HTTP 401 - {}", context, truncate(body))),
        403 => {
            if is_capacity_error(body) {
                if let Some(zone) = zone {
                    return Error::QuotaExceeded {
                        zone: zone.to_string(),
                        message: truncate(body),
                    };
                }
            }
            Error::Auth(format!("{}: HTTP 403 - {}", context, truncate(body)))
        }
        404 => Error::NotFound(context.to_string()),
        429 => Error::TransientNetwork(format!("{}: HTTP 429 - {}", context, truncate(body))),
        500..=599 => {
            Error::TransientNetwork(format!("{}: HTTP {} - {}", context, status, truncate(body)))
        }
        _ => Error::Provider(format!("{}: HTTP {} - {}", context, status, truncate(body))),
    }
}

fn operation_error(zone: &str, errors: &[serde_json::Value]) -> Error {
    let joined = errors
        .iter()
        .map(|e| {
            format!(
                "{}: {}",
                e["code"].as_str().unwrap_or("UNKNOWN"),
                e["message"].as_str().unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    let capacity = errors.iter().any(|e| {
        e["code"]
            .as_str()
            .map(is_capacity_error)
            .unwrap_or(false)
    });
    if capacity {
        Error::QuotaExceeded {
            zone: zone.to_string(),
            message: joined,
        }
    } else {
        Error::Provider(format!("operation failed in zone {}: {}", zone, joined))
    }
}

fn map_status(status: &str) -> InstanceStatus {
    match status {
        "PROVISIONING" | "STAGING" => InstanceStatus::Creating,
        "RUNNING" => InstanceStatus::Running,
        "STOPPING" | "SUSPENDING" => InstanceStatus::Stopping,
        "TERMINATED" | "STOPPED" | "SUSPENDED" => InstanceStatus::Stopped,
        _ => InstanceStatus::Creating,
    }
}

fn parse_instance(v: &serde_json::Value) -> InstanceRecord {
    let name = v["name"].as_str().unwrap_or_default().to_string();
    // Zone arrives as a full resource URL; keep only the trailing segment.
    let zone = v["zone"]
        .as_str()
        .and_then(|z| z.rsplit('/').next())
        .map(|z| z.to_string());
    let status = v["status"]
        .as_str()
        .map(map_status)
        .unwrap_or(InstanceStatus::Creating);
    let external_ip = v["networkInterfaces"][0]["accessConfigs"][0]["natIP"]
        .as_str()
        .map(|s| s.to_string());
    let created_at = v["creationTimestamp"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc));
    InstanceRecord {
        name,
        zone,
        status,
        external_ip,
        created_at,
    }
}

fn parse_firewall_rule(v: &serde_json::Value) -> Option<FirewallRule> {
    let name = v["name"].as_str()?.to_string();
    let target_tag = v["targetTags"][0].as_str().unwrap_or_default().to_string();
    let source_range = v["sourceRanges"][0].as_str()?.to_string();
    let port = v["allowed"][0]["ports"][0]
        .as_str()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    Some(FirewallRule {
        name,
        target_tag,
        source_range,
        port,
    })
}
