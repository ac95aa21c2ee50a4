pub mod config;
pub mod error;

pub use config::Config;
pub use error::{Error, ErrorClass, Result, ZoneAttempt};

use serde::{Deserialize, Serialize};
use std::time::Duration;

// --- Enums ---

/// Instance state as the core sees it. Provider-native status strings are
/// mapped into this enum by each provider implementation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Absent,
    Creating,
    Running,
    Stopping,
    Stopped,
    Deleting,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Absent => "absent",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

// --- Entities ---

/// Last-observed snapshot of a cloud instance. Never authoritative across
/// calls; every lifecycle operation re-queries the provider before acting.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceRecord {
    pub name: String,
    pub zone: Option<String>,
    pub status: InstanceStatus,
    pub external_ip: Option<String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Zone names tried as a unit before falling through to the next group.
/// `*` expands to all known zones not already listed, in provider order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneGroup {
    pub zones: Vec<String>,
}

pub const ZONE_WILDCARD: &str = "*";

/// Parse a zone priority string into ordered groups.
///
/// Groups are separated by `;`, zones within a group by `,`:
/// `"europe-west1,europe-west4;us-central1;*;asia-east1"`.
pub fn parse_zone_priority(raw: &str) -> Result<Vec<ZoneGroup>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Config("zone priority string is empty".into()));
    }
    let mut groups = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut wildcard_seen = false;
    for group_raw in raw.split(';') {
        let zones: Vec<String> = group_raw
            .split(',')
            .map(|z| z.trim().to_string())
            .filter(|z| !z.is_empty())
            .collect();
        if zones.is_empty() {
            return Err(Error::Config(format!(
                "zone priority '{}' contains an empty group",
                raw
            )));
        }
        for zone in &zones {
            if zone == ZONE_WILDCARD {
                if wildcard_seen {
                    return Err(Error::Config(
                        "zone priority may contain at most one '*' wildcard".into(),
                    ));
                }
                wildcard_seen = true;
            } else if !seen.insert(zone.clone()) {
                return Err(Error::Config(format!(
                    "zone '{}' listed more than once in priority string",
                    zone
                )));
            }
        }
        groups.push(ZoneGroup { zones });
    }
    Ok(groups)
}

/// Everything needed to place and provision one instance. Immutable for the
/// duration of a lifecycle call.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub machine_type: String,
    pub image_family: String,
    pub disk_size_gb: u32,
    pub gpu_accelerator: Option<String>,
    pub zone_groups: Vec<ZoneGroup>,
    pub firewall_tag: String,
    pub model: String,
    pub ssh_user: String,
    pub ssh_public_key: Option<String>,
}

/// A provider firewall rule scoped to a single source IP/CIDR. At most one
/// rule per name exists; re-ensuring updates the source in place.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub target_tag: String,
    pub source_range: String,
    pub port: u16,
}

/// Bounded-retry parameters. `timeout` is the hard ceiling regardless of
/// attempts remaining.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("retry timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Outcome of a successful `create`, reported back to the caller.
#[derive(Debug, Clone)]
pub struct ProvisioningResult {
    pub instance: String,
    pub ip: String,
    pub model: String,
    pub ready: bool,
    pub elapsed: Duration,
}
