use async_trait::async_trait;
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llmvm_common::config::SshConfig;
use llmvm_common::{Error, Result};

use crate::provision::{ExecOutput, RemoteExec, RemoteShell};

/// Key-pair-authenticated SSH connector. All libssh2 work runs on the
/// blocking pool; the async surface stays non-blocking.
///
/// Connection and authentication failures surface as `RemoteExec` so the
/// provisioner's retry policy governs how often we re-dial a booting
/// instance whose sshd is not up yet.
pub struct SshConnector {
    user: String,
    private_key: PathBuf,
    public_key: Option<PathBuf>,
    port: u16,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(cfg: &SshConfig) -> Self {
        SshConnector {
            user: cfg.user.clone(),
            private_key: cfg.private_key.clone(),
            public_key: cfg.public_key.clone(),
            port: 22,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl RemoteShell for SshConnector {
    async fn connect(&self, ip: &str) -> Result<Box<dyn RemoteExec>> {
        let user = self.user.clone();
        let private_key = self.private_key.clone();
        let public_key = self.public_key.clone();
        let addr = format!("{}:{}", ip, self.port);
        let timeout = self.connect_timeout;

        let session = tokio::task::spawn_blocking(move || -> Result<ssh2::Session> {
            let socket_addr: SocketAddr = addr
                .parse()
                .map_err(|e| Error::RemoteExec(format!("invalid address '{}': {}", addr, e)))?;
            let tcp = TcpStream::connect_timeout(&socket_addr, timeout)
                .map_err(|e| Error::RemoteExec(format!("cannot reach {}: {}", addr, e)))?;
            let mut session = ssh2::Session::new()
                .map_err(|e| Error::RemoteExec(format!("session init failed: {}", e)))?;
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| Error::RemoteExec(format!("handshake with {} failed: {}", addr, e)))?;
            session
                .userauth_pubkey_file(&user, public_key.as_deref(), &private_key, None)
                .map_err(|e| {
                    Error::RemoteExec(format!("key authentication as '{}' failed: {}", user, e))
                })?;
            Ok(session)
        })
        .await
        .map_err(|e| Error::RemoteExec(format!("ssh connect task failed: {}", e)))??;

        tracing::debug!(ip, "ssh session established");
        Ok(Box::new(Ssh2Exec {
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

/// An established SSH session. `close` disconnects explicitly; dropping the
/// inner session tears down the transport as a backstop.
pub struct Ssh2Exec {
    session: Arc<Mutex<ssh2::Session>>,
}

#[async_trait]
impl RemoteExec for Ssh2Exec {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let session = Arc::clone(&self.session);
        let command = command.to_string();
        tokio::task::spawn_blocking(move || -> Result<ExecOutput> {
            let session = session
                .lock()
                .map_err(|_| Error::RemoteExec("ssh session mutex poisoned".into()))?;
            let mut channel = session
                .channel_session()
                .map_err(|e| Error::RemoteExec(format!("cannot open channel: {}", e)))?;
            channel
                .exec(&command)
                .map_err(|e| Error::RemoteExec(format!("cannot exec '{}': {}", command, e)))?;
            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|e| Error::RemoteExec(format!("reading stdout failed: {}", e)))?;
            let mut stderr = String::new();
            channel
                .stderr()
                .read_to_string(&mut stderr)
                .map_err(|e| Error::RemoteExec(format!("reading stderr failed: {}", e)))?;
            channel
                .wait_close()
                .map_err(|e| Error::RemoteExec(format!("channel close failed: {}", e)))?;
            let exit_code = channel
                .exit_status()
                .map_err(|e| Error::RemoteExec(format!("cannot read exit status: {}", e)))?;
            Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            })
        })
        .await
        .map_err(|e| Error::RemoteExec(format!("ssh exec task failed: {}", e)))?
    }

    async fn close(&self) {
        let session = Arc::clone(&self.session);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(session) = session.lock() {
                let _ = session.disconnect(None, "session closed", None);
            }
        })
        .await;
    }
}
