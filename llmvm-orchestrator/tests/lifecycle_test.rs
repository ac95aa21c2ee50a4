// End-to-end lifecycle scenarios against the in-memory provider, a scripted
// remote shell, and a stub Ollama/IP-discovery HTTP server.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llmvm_common::{parse_zone_priority, Error, InstanceSpec, InstanceStatus, Result, RetryPolicy};
use llmvm_orchestrator::{
    CreateOutcome, ExecOutput, FirewallManager, LifecycleManager, OllamaApi, RemoteExec,
    RemoteProvisioner, RemoteShell,
};
use llmvm_providers::mock::MockCompute;
use llmvm_providers::CloudCompute;

struct FakeExec {
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteExec for FakeExec {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn close(&self) {}
}

struct FakeShell {
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn connect(&self, _ip: &str) -> Result<Box<dyn RemoteExec>> {
        Ok(Box::new(FakeExec {
            commands: Arc::clone(&self.commands),
        }))
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        interval: Duration::from_millis(10),
        timeout: Duration::from_secs(2),
    }
}

fn spec(name: &str, model: &str, priority: &str) -> InstanceSpec {
    InstanceSpec {
        name: name.into(),
        machine_type: "n1-standard-4".into(),
        image_family: "ubuntu-2204-lts".into(),
        disk_size_gb: 30,
        gpu_accelerator: Some("nvidia-tesla-t4".into()),
        zone_groups: parse_zone_priority(priority).unwrap(),
        firewall_tag: "ollama-server".into(),
        model: model.into(),
        ssh_user: "llm".into(),
        ssh_public_key: None,
    }
}

struct Harness {
    compute: Arc<MockCompute>,
    manager: LifecycleManager,
    commands: Arc<Mutex<Vec<String>>>,
    _server: MockServer,
}

/// Stub server answering IP discovery, the runtime root and the model
/// listing, plus a mock provider handing out loopback IPs so the health
/// probes land on the stub.
async fn harness(zones: &[&str], caller_ip: &str, models: serde_json::Value) -> Harness {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ip"))
        .respond_with(ResponseTemplate::new(200).set_body_string(caller_ip.to_string()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Ollama is running"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(models))
        .mount(&server)
        .await;

    let compute = Arc::new(MockCompute::new(zones));
    // One loopback IP for the create path so health probes hit the stub;
    // later starts fall back to the generated pool and rotate the address.
    compute.set_ip_pool(&["127.0.0.1"]);

    let commands = Arc::new(Mutex::new(Vec::new()));
    let shell = Arc::new(FakeShell {
        commands: Arc::clone(&commands),
    });
    let port = server.address().port();
    let firewall = FirewallManager::new(
        compute.clone(),
        format!("{}/ip", server.uri()),
        "allow-ollama".into(),
        port,
        fast_policy(),
    )
    .unwrap();
    let provisioner =
        RemoteProvisioner::new(shell, OllamaApi::new(port).unwrap(), fast_policy());
    let manager = LifecycleManager::new(compute.clone(), firewall, provisioner, fast_policy());

    Harness {
        compute,
        manager,
        commands,
        _server: server,
    }
}

#[tokio::test]
async fn create_on_clean_project_reaches_running_and_ready() {
    let h = harness(
        &["europe-west4-a"],
        "203.0.113.7",
        json!({"models": [{"name": "tinyllama:latest"}]}),
    )
    .await;

    let outcome = h
        .manager
        .create(&spec("vm1", "tinyllama", "europe-west4-a"))
        .await
        .unwrap();

    let result = match outcome {
        CreateOutcome::Provisioned(result) => result,
        other => panic!("expected a provisioned instance, got {:?}", other),
    };
    assert!(result.ready);
    assert_eq!(result.instance, "vm1");
    assert_eq!(result.model, "tinyllama");

    // Instance is RUNNING.
    let record = h.compute.get("vm1").await.unwrap();
    assert_eq!(record.status, InstanceStatus::Running);

    // Firewall rule exists and is scoped to the caller's IP only.
    let rules = h.compute.firewall_rules();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].source_range, "203.0.113.7/32");
    assert_eq!(rules[0].target_tag, "ollama-server");

    // The model was pulled over the remote channel.
    assert!(h
        .commands
        .lock()
        .unwrap()
        .iter()
        .any(|c| c == "ollama pull tinyllama"));
}

#[tokio::test]
async fn create_twice_returns_existing_without_duplicate() {
    let h = harness(
        &["a"],
        "203.0.113.7",
        json!({"models": [{"name": "tinyllama:latest"}]}),
    )
    .await;
    let spec = spec("vm1", "tinyllama", "a");

    let first = h.manager.create(&spec).await.unwrap();
    assert!(matches!(first, CreateOutcome::Provisioned(_)));

    let second = h.manager.create(&spec).await.unwrap();
    match second {
        CreateOutcome::AlreadyExists(record) => {
            assert_eq!(record.name, "vm1");
            assert_eq!(record.status, InstanceStatus::Running);
        }
        other => panic!("expected the existing record, got {:?}", other),
    }

    // Exactly one instance, exactly one create attempt against the cloud.
    assert_eq!(h.manager.list().await.unwrap().len(), 1);
    assert_eq!(h.compute.create_attempts().len(), 1);
}

#[tokio::test]
async fn delete_absent_instance_is_a_no_op() {
    let h = harness(&["a"], "203.0.113.7", json!({"models": []})).await;
    assert!(h.manager.delete("ghost").await.is_ok());
}

#[tokio::test]
async fn start_absent_instance_is_not_found() {
    let h = harness(&["a"], "203.0.113.7", json!({"models": []})).await;
    let err = h.manager.start("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn stop_absent_instance_is_not_found() {
    let h = harness(&["a"], "203.0.113.7", json!({"models": []})).await;
    let err = h.manager.stop("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn stop_then_start_transitions_and_returns_fresh_ip() {
    let h = harness(
        &["a"],
        "203.0.113.7",
        json!({"models": [{"name": "tinyllama:latest"}]}),
    )
    .await;
    h.manager
        .create(&spec("vm1", "tinyllama", "a"))
        .await
        .unwrap();
    let ip_before = h.compute.get("vm1").await.unwrap().external_ip;

    let stopped = h.manager.stop("vm1").await.unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);

    let started = h.manager.start("vm1").await.unwrap();
    assert_eq!(started.status, InstanceStatus::Running);
    assert!(started.external_ip.is_some());
    // Ephemeral IP may change across stop/start; the mock always rotates.
    assert_ne!(started.external_ip, ip_before);
}

#[tokio::test]
async fn stop_twice_is_idempotent() {
    let h = harness(
        &["a"],
        "203.0.113.7",
        json!({"models": [{"name": "tinyllama:latest"}]}),
    )
    .await;
    h.manager
        .create(&spec("vm1", "tinyllama", "a"))
        .await
        .unwrap();

    h.manager.stop("vm1").await.unwrap();
    let again = h.manager.stop("vm1").await.unwrap();
    assert_eq!(again.status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn delete_after_create_removes_instance() {
    let h = harness(
        &["a"],
        "203.0.113.7",
        json!({"models": [{"name": "tinyllama:latest"}]}),
    )
    .await;
    h.manager
        .create(&spec("vm1", "tinyllama", "a"))
        .await
        .unwrap();

    h.manager.delete("vm1").await.unwrap();
    assert!(h.compute.get("vm1").await.unwrap_err().is_not_found());
    // And deleting again is still fine.
    assert!(h.manager.delete("vm1").await.is_ok());
}
