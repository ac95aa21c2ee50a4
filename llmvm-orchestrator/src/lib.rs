pub mod firewall;
pub mod lifecycle;
pub mod ollama;
pub mod provision;
pub mod retry;
pub mod ssh;
pub mod zones;

pub use firewall::FirewallManager;
pub use lifecycle::{CreateOutcome, LifecycleManager};
pub use ollama::OllamaApi;
pub use provision::{ExecOutput, RemoteExec, RemoteProvisioner, RemoteShell};
pub use ssh::SshConnector;
