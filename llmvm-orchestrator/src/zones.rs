use llmvm_common::{
    Error, ErrorClass, InstanceRecord, InstanceSpec, Result, RetryPolicy, ZoneAttempt, ZoneGroup,
    ZONE_WILDCARD,
};
use llmvm_providers::CloudCompute;

use crate::retry;

/// Expand priority groups into concrete zone candidate lists.
///
/// Within a group, zones keep their configured order. The wildcard expands
/// to every known zone not already mentioned anywhere earlier, in
/// provider-returned order. A zone never appears twice across the result.
pub fn candidate_groups(groups: &[ZoneGroup], known_zones: &[String]) -> Vec<Vec<String>> {
    let mut seen: Vec<String> = Vec::new();
    let mut result = Vec::new();
    for group in groups {
        let mut expanded = Vec::new();
        for zone in &group.zones {
            if zone == ZONE_WILDCARD {
                for known in known_zones {
                    if !seen.contains(known) {
                        seen.push(known.clone());
                        expanded.push(known.clone());
                    }
                }
            } else if !seen.contains(zone) {
                seen.push(zone.clone());
                expanded.push(zone.clone());
            }
        }
        if !expanded.is_empty() {
            result.push(expanded);
        }
    }
    result
}

/// Drive placement across the spec's zone priority groups.
///
/// Each zone's create is wrapped in the retry executor. Capacity/quota
/// failures advance to the next candidate; so does a zone whose transient
/// failures exhausted the policy. Fatal errors (auth, configuration) abort
/// immediately — retrying elsewhere cannot fix a permissions problem. When
/// every candidate is exhausted the per-group last causes are aggregated
/// into `NoZoneAvailable`.
pub async fn place(
    compute: &dyn CloudCompute,
    spec: &InstanceSpec,
    policy: &RetryPolicy,
) -> Result<InstanceRecord> {
    let needs_wildcard = spec
        .zone_groups
        .iter()
        .any(|g| g.zones.iter().any(|z| z == ZONE_WILDCARD));
    let known_zones = if needs_wildcard {
        compute.list_zones().await?
    } else {
        Vec::new()
    };
    let groups = candidate_groups(&spec.zone_groups, &known_zones);
    if groups.is_empty() {
        return Err(Error::Config("zone priority resolves to no candidate zones".into()));
    }

    let mut attempts: Vec<ZoneAttempt> = Vec::new();
    for (group_idx, group) in groups.iter().enumerate() {
        let mut group_last: Option<ZoneAttempt> = None;
        for zone in group {
            tracing::info!(instance = %spec.name, zone = %zone, group = group_idx, "attempting placement");
            match retry::run(policy, || compute.create(spec, zone)).await {
                Ok(record) => {
                    tracing::info!(instance = %spec.name, zone = %zone, "instance placed");
                    return Ok(record);
                }
                Err(e) => match e.class() {
                    ErrorClass::RetryableNextZone | ErrorClass::Retryable => {
                        tracing::warn!(zone = %zone, error = %e, "zone unavailable, trying next candidate");
                        group_last = Some(ZoneAttempt {
                            zone: zone.clone(),
                            cause: e.to_string(),
                        });
                    }
                    _ => return Err(e),
                },
            }
        }
        if let Some(last) = group_last {
            attempts.push(last);
        }
    }
    Err(Error::NoZoneAvailable { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmvm_common::parse_zone_priority;
    use llmvm_providers::mock::{MockCompute, MockFailure};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    fn spec(priority: &str) -> InstanceSpec {
        InstanceSpec {
            name: "vm1".into(),
            machine_type: "n1-standard-4".into(),
            image_family: "ubuntu-2204-lts".into(),
            disk_size_gb: 30,
            gpu_accelerator: None,
            zone_groups: parse_zone_priority(priority).unwrap(),
            firewall_tag: "ollama-server".into(),
            model: "tinyllama".into(),
            ssh_user: "llm".into(),
            ssh_public_key: None,
        }
    }

    #[test]
    fn wildcard_expands_to_remaining_zones_in_provider_order() {
        let groups = parse_zone_priority("a,b;*").unwrap();
        let known = vec!["c".to_string(), "a".to_string(), "d".to_string()];
        let candidates = candidate_groups(&groups, &known);
        assert_eq!(candidates, vec![vec!["a", "b"], vec!["c", "d"]]);
    }

    #[test]
    fn explicit_zone_after_wildcard_is_not_repeated() {
        let groups = parse_zone_priority("*;a").unwrap();
        let known = vec!["a".to_string(), "b".to_string()];
        let candidates = candidate_groups(&groups, &known);
        // 'a' was consumed by the wildcard group already.
        assert_eq!(candidates, vec![vec!["a", "b"]]);
    }

    #[tokio::test]
    async fn quota_failures_fall_through_to_wildcard_zones() {
        let mock = MockCompute::new(&["a", "b", "c", "d"]);
        mock.fail_zone("a", MockFailure::Quota);
        mock.fail_zone("b", MockFailure::Quota);
        let record = place(&mock, &spec("a,b;*"), &policy()).await.unwrap();
        let placed_zone = record.zone.unwrap();
        assert!(placed_zone == "c" || placed_zone == "d");
        let attempts = mock.create_attempts();
        // a and b each tried exactly once, never re-attempted.
        assert_eq!(attempts.iter().filter(|z| *z == "a").count(), 1);
        assert_eq!(attempts.iter().filter(|z| *z == "b").count(), 1);
        assert_eq!(attempts[0], "a");
        assert_eq!(attempts[1], "b");
        assert_eq!(attempts[2], "c");
    }

    #[tokio::test]
    async fn auth_error_aborts_without_trying_further_zones() {
        let mock = MockCompute::new(&["a", "b", "c"]);
        mock.fail_zone("a", MockFailure::Auth);
        let err = place(&mock, &spec("a;b;c"), &policy()).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(mock.create_attempts(), vec!["a"]);
    }

    #[tokio::test]
    async fn transient_failure_retries_in_same_zone_before_advancing() {
        let mock = MockCompute::new(&["a", "b"]);
        mock.fail_zone("a", MockFailure::Transient { remaining: 2 });
        let record = place(&mock, &spec("a;b"), &policy()).await.unwrap();
        assert_eq!(record.zone.as_deref(), Some("a"));
        assert_eq!(mock.create_attempts(), vec!["a", "a", "a"]);
    }

    #[tokio::test]
    async fn exhaustion_aggregates_last_cause_per_group() {
        let mock = MockCompute::new(&["a", "b", "c"]);
        mock.fail_zone("a", MockFailure::Quota);
        mock.fail_zone("b", MockFailure::Quota);
        mock.fail_zone("c", MockFailure::Quota);
        let err = place(&mock, &spec("a,b;c"), &policy()).await.unwrap_err();
        match err {
            Error::NoZoneAvailable { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].zone, "b");
                assert_eq!(attempts[1].zone, "c");
            }
            other => panic!("expected NoZoneAvailable, got {:?}", other),
        }
    }
}
