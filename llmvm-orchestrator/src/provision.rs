use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;

use llmvm_common::{Error, InstanceRecord, ProvisioningResult, Result, RetryPolicy};

use crate::ollama::OllamaApi;
use crate::retry;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One open remote command-execution session. Implementations must release
/// the underlying connection in `close` and again on drop as a backstop.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
    async fn close(&self);
}

/// Opens remote sessions to an instance. The production implementation is
/// the SSH connector; tests substitute a scripted fake.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self, ip: &str) -> Result<Box<dyn RemoteExec>>;
}

/// Installation sequence for the inference runtime. Every command is safe to
/// re-run: install and unit-file edits are guarded by existence checks.
fn install_commands() -> Vec<String> {
    vec![
        "sudo DEBIAN_FRONTEND=noninteractive apt-get update -y".to_string(),
        "command -v ollama >/dev/null 2>&1 || (curl -fsSL https://ollama.com/install.sh | sh)"
            .to_string(),
        concat!(
            "sudo grep -q 'OLLAMA_HOST' /etc/systemd/system/ollama.service || ",
            "sudo sed -i '/^\\[Service\\]/a Environment=\"OLLAMA_HOST=0.0.0.0\"' ",
            "/etc/systemd/system/ollama.service"
        )
        .to_string(),
        "sudo systemctl daemon-reload".to_string(),
        "sudo systemctl restart ollama".to_string(),
        "ollama --version".to_string(),
    ]
}

/// Installs and starts the inference runtime on a freshly placed instance
/// and pulls the requested model.
///
/// There is no rollback on failure: when a step fails after the instance was
/// created, the instance stays RUNNING but unprovisioned and the caller
/// decides whether to retry provisioning or delete it.
pub struct RemoteProvisioner {
    shell: Arc<dyn RemoteShell>,
    ollama: OllamaApi,
    policy: RetryPolicy,
}

impl RemoteProvisioner {
    pub fn new(shell: Arc<dyn RemoteShell>, ollama: OllamaApi, policy: RetryPolicy) -> Self {
        RemoteProvisioner {
            shell,
            ollama,
            policy,
        }
    }

    pub async fn provision(
        &self,
        record: &InstanceRecord,
        model: &str,
    ) -> Result<ProvisioningResult> {
        let started = Instant::now();
        let ip = record
            .external_ip
            .clone()
            .ok_or_else(|| {
                Error::Provider(format!("instance '{}' has no external IP", record.name))
            })?;

        tracing::info!(instance = %record.name, ip = %ip, "opening remote session");
        let session = retry::run(&self.policy, || self.shell.connect(&ip)).await?;

        // The session is closed on every exit path below, success or
        // failure, before the outcome is inspected.
        let outcome = self.run_steps(session.as_ref(), &ip, model).await;
        session.close().await;
        let ready = outcome?;

        if ready {
            tracing::info!(instance = %record.name, model, "inference runtime ready");
        } else {
            tracing::warn!(
                instance = %record.name,
                model,
                "instance provisioned but runtime/model did not become ready within the timeout"
            );
        }
        Ok(ProvisioningResult {
            instance: record.name.clone(),
            ip,
            model: model.to_string(),
            ready,
            elapsed: started.elapsed(),
        })
    }

    async fn run_steps(&self, session: &dyn RemoteExec, ip: &str, model: &str) -> Result<bool> {
        for command in install_commands() {
            self.exec_checked(session, &command).await?;
        }

        if !self.ollama.wait_serving(ip, &self.policy).await {
            tracing::warn!(ip, "runtime health endpoint never became ready");
            return Ok(false);
        }

        tracing::info!(model, "pulling model");
        self.exec_checked(session, &format!("ollama pull {}", model))
            .await?;

        Ok(self.ollama.wait_model(ip, model, &self.policy).await)
    }

    /// Run one command with the retry policy; a nonzero exit status is a
    /// `RemoteExec` failure carrying the stderr tail.
    async fn exec_checked(&self, session: &dyn RemoteExec, command: &str) -> Result<ExecOutput> {
        retry::run(&self.policy, move || async move {
            tracing::debug!(command, "running remote command");
            let output = session.exec(command).await?;
            if output.exit_code != 0 {
                let stderr: String = output.stderr.chars().take(500).collect();
                return Err(Error::RemoteExec(format!(
                    "command '{}' exited with status {}: {}",
                    command, output.exit_code, stderr
                )));
            }
            Ok(output)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmvm_common::InstanceStatus;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records commands; optionally fails the first N execs transiently.
    struct FakeExec {
        commands: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<bool>>,
        fail_first: Mutex<u32>,
    }

    #[async_trait]
    impl RemoteExec for FakeExec {
        async fn exec(&self, command: &str) -> Result<ExecOutput> {
            {
                let mut remaining = self.fail_first.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::RemoteExec("channel dropped".into()));
                }
            }
            self.commands.lock().unwrap().push(command.to_string());
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    struct FakeShell {
        commands: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<bool>>,
        fail_first_exec: u32,
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn connect(&self, _ip: &str) -> Result<Box<dyn RemoteExec>> {
            Ok(Box::new(FakeExec {
                commands: Arc::clone(&self.commands),
                closed: Arc::clone(&self.closed),
                fail_first: Mutex::new(self.fail_first_exec),
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

    fn record(ip: Option<&str>) -> InstanceRecord {
        InstanceRecord {
            name: "vm1".into(),
            zone: Some("europe-west4-a".into()),
            status: InstanceStatus::Running,
            external_ip: ip.map(|s| s.to_string()),
            created_at: None,
        }
    }

    async fn serving_ollama(models: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(models))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn provisions_installs_and_pulls_model() {
        let server = serving_ollama(json!({"models": [{"name": "tinyllama:latest"}]})).await;
        let commands = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let shell = Arc::new(FakeShell {
            commands: Arc::clone(&commands),
            closed: Arc::clone(&closed),
            fail_first_exec: 0,
        });
        let provisioner = RemoteProvisioner::new(
            shell,
            OllamaApi::new(server.address().port()).unwrap(),
            fast_policy(),
        );

        let result = provisioner
            .provision(&record(Some("127.0.0.1")), "tinyllama")
            .await
            .unwrap();

        assert!(result.ready);
        assert_eq!(result.instance, "vm1");
        let ran = commands.lock().unwrap().clone();
        assert!(ran.iter().any(|c| c.contains("ollama.com/install.sh")));
        assert!(ran.iter().any(|c| c == "ollama pull tinyllama"));
        // Install-before-pull ordering.
        let install_idx = ran.iter().position(|c| c.contains("install.sh")).unwrap();
        let pull_idx = ran.iter().position(|c| c == "ollama pull tinyllama").unwrap();
        assert!(install_idx < pull_idx);
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn transient_exec_failures_are_retried() {
        let server = serving_ollama(json!({"models": [{"name": "tinyllama:latest"}]})).await;
        let commands = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let shell = Arc::new(FakeShell {
            commands: Arc::clone(&commands),
            closed: Arc::clone(&closed),
            fail_first_exec: 2,
        });
        let provisioner = RemoteProvisioner::new(
            shell,
            OllamaApi::new(server.address().port()).unwrap(),
            fast_policy(),
        );
        let result = provisioner
            .provision(&record(Some("127.0.0.1")), "tinyllama")
            .await
            .unwrap();
        assert!(result.ready);
    }

    #[tokio::test]
    async fn session_closed_even_when_a_step_fails() {
        // No HTTP stub: commands succeed but the runtime never serves, which
        // exercises the not-ready path; the session must still be closed.
        let commands = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let shell = Arc::new(FakeShell {
            commands: Arc::clone(&commands),
            closed: Arc::clone(&closed),
            fail_first_exec: 0,
        });
        let policy = RetryPolicy {
            max_attempts: 2,
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
        };
        // Port 9 (discard) is never serving HTTP.
        let provisioner =
            RemoteProvisioner::new(shell, OllamaApi::new(9).unwrap(), policy);
        let result = provisioner
            .provision(&record(Some("127.0.0.1")), "tinyllama")
            .await
            .unwrap();
        assert!(!result.ready);
        assert!(*closed.lock().unwrap());
        // Pull must not run when the runtime never came up.
        assert!(!commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with("ollama pull")));
    }

    #[tokio::test]
    async fn missing_external_ip_is_an_error() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let shell = Arc::new(FakeShell {
            commands,
            closed,
            fail_first_exec: 0,
        });
        let provisioner =
            RemoteProvisioner::new(shell, OllamaApi::new(11434).unwrap(), fast_policy());
        let err = provisioner
            .provision(&record(None), "tinyllama")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
