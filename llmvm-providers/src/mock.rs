use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use llmvm_common::{
    Error, FirewallRule, InstanceRecord, InstanceSpec, InstanceStatus, Result,
};

use crate::CloudCompute;

/// Scripted failure for a zone's next `create` calls.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Zone is out of capacity; every create in it fails.
    Quota,
    /// Credentials rejected; fatal for the whole placement.
    Auth,
    /// Fails `remaining` times with a transient error, then succeeds.
    Transient { remaining: u32 },
}

#[derive(Default)]
struct MockState {
    zones: Vec<String>,
    instances: HashMap<String, InstanceRecord>,
    firewalls: HashMap<String, FirewallRule>,
    failures: HashMap<String, MockFailure>,
    create_attempts: Vec<String>,
    ip_pool: Vec<String>,
    next_ip: u32,
}

/// In-memory provider for tests. Mirrors the contract of the real client:
/// name-keyed instances, idempotent firewall ensure, fresh IP on restart.
pub struct MockCompute {
    state: Mutex<MockState>,
}

impl MockCompute {
    pub fn new(zones: &[&str]) -> Self {
        MockCompute {
            state: Mutex::new(MockState {
                zones: zones.iter().map(|z| z.to_string()).collect(),
                ..Default::default()
            }),
        }
    }

    /// Script the next create failures for a zone.
    pub fn fail_zone(&self, zone: &str, failure: MockFailure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(zone.to_string(), failure);
    }

    /// Hand out these IPs (in order) before falling back to the generated
    /// 10.0.0.x pool. Lets tests point instances at a local stub server.
    pub fn set_ip_pool(&self, ips: &[&str]) {
        self.state.lock().unwrap().ip_pool = ips.iter().map(|s| s.to_string()).collect();
    }

    /// Zones `create` was attempted in, in call order.
    pub fn create_attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().create_attempts.clone()
    }

    pub fn firewall_rules(&self) -> Vec<FirewallRule> {
        self.state.lock().unwrap().firewalls.values().cloned().collect()
    }

    fn allocate_ip(state: &mut MockState) -> String {
        if !state.ip_pool.is_empty() {
            return state.ip_pool.remove(0);
        }
        state.next_ip += 1;
        format!("10.0.0.{}", state.next_ip)
    }
}

#[async_trait]
impl CloudCompute for MockCompute {
    async fn get(&self, name: &str) -> Result<InstanceRecord> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("instance '{}' not found", name)))
    }

    async fn create(&self, spec: &InstanceSpec, zone: &str) -> Result<InstanceRecord> {
        let mut state = self.state.lock().unwrap();
        state.create_attempts.push(zone.to_string());
        if !state.zones.iter().any(|z| z == zone) {
            return Err(Error::Provider(format!("unknown zone '{}'", zone)));
        }
        match state.failures.get_mut(zone) {
            Some(MockFailure::Quota) => {
                return Err(Error::QuotaExceeded {
                    zone: zone.to_string(),
                    message: "zone resource pool exhausted".into(),
                });
            }
            Some(MockFailure::Auth) => {
                return Err(Error::Auth("service account lacks compute.instances.insert".into()));
            }
            Some(MockFailure::Transient { remaining }) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::TransientNetwork("connection reset by provider".into()));
                }
            }
            None => {}
        }
        if state.instances.contains_key(&spec.name) {
            return Err(Error::Provider(format!(
                "instance '{}' already exists",
                spec.name
            )));
        }
        let ip = Self::allocate_ip(&mut state);
        let record = InstanceRecord {
            name: spec.name.clone(),
            zone: Some(zone.to_string()),
            status: InstanceStatus::Running,
            external_ip: Some(ip),
            created_at: Some(chrono::Utc::now()),
        };
        state.instances.insert(spec.name.clone(), record.clone());
        Ok(record)
    }

    async fn start(&self, name: &str, zone: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ip = Self::allocate_ip(&mut state);
        let record = state
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("instance '{}' not found", name)))?;
        if record.zone.as_deref() != Some(zone) {
            return Err(Error::NotFound(format!(
                "instance '{}' not found in zone {}",
                name, zone
            )));
        }
        record.status = InstanceStatus::Running;
        // Ephemeral external IPs are released on stop; starting assigns a
        // fresh one.
        record.external_ip = Some(ip);
        Ok(())
    }

    async fn stop(&self, name: &str, zone: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("instance '{}' not found", name)))?;
        if record.zone.as_deref() != Some(zone) {
            return Err(Error::NotFound(format!(
                "instance '{}' not found in zone {}",
                name, zone
            )));
        }
        record.status = InstanceStatus::Stopped;
        record.external_ip = None;
        Ok(())
    }

    async fn delete(&self, name: &str, zone: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.instances.get(name) {
            Some(record) if record.zone.as_deref() == Some(zone) => {
                state.instances.remove(name);
                Ok(())
            }
            _ => Err(Error::NotFound(format!(
                "instance '{}' not found in zone {}",
                name, zone
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<InstanceRecord> = state.instances.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().zones.clone())
    }

    async fn get_firewall_rule(&self, name: &str) -> Result<FirewallRule> {
        let state = self.state.lock().unwrap();
        state
            .firewalls
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("firewall rule '{}' not found", name)))
    }

    async fn ensure_firewall_rule(&self, rule: &FirewallRule) -> Result<FirewallRule> {
        let mut state = self.state.lock().unwrap();
        state.firewalls.insert(rule.name.clone(), rule.clone());
        Ok(rule.clone())
    }
}
