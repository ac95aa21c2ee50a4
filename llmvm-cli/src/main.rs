use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llmvm_common::{Config, ZONE_WILDCARD};
use llmvm_orchestrator::{
    CreateOutcome, FirewallManager, LifecycleManager, OllamaApi, RemoteProvisioner, SshConnector,
};
use llmvm_providers::CloudCompute;

#[derive(Parser)]
#[command(
    name = "llmvm",
    version,
    about = "Manage GPU cloud instances running an Ollama inference server"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Increase log verbosity
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an instance, set up the inference runtime and pull a model
    Create {
        /// Instance name (default: from config)
        #[arg(long)]
        name: Option<String>,
        /// Model to pull (default: from config)
        #[arg(long)]
        model: Option<String>,
    },
    /// Start an existing, stopped instance
    Start {
        #[arg(long)]
        name: Option<String>,
    },
    /// Stop a running instance
    Stop {
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete an instance
    Delete {
        #[arg(long)]
        name: Option<String>,
    },
    /// List all instances in the project
    List,
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("configuration file '{}' not found", path.display()))?;
    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("invalid configuration in '{}'", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

fn init_tracing(verbose: u8, config_level: Option<&str>) {
    let level = if verbose > 0 {
        "debug"
    } else {
        config_level.unwrap_or("info")
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_compute(cfg: &Config) -> anyhow::Result<Arc<dyn CloudCompute>> {
    match cfg.provider.as_str() {
        "gcp" => {
            let token = std::env::var(&cfg.gcp.access_token_env).with_context(|| {
                format!(
                    "environment variable '{}' with the GCP access token is not set",
                    cfg.gcp.access_token_env
                )
            })?;
            Ok(Arc::new(llmvm_providers::gcp::GcpCompute::new(
                &cfg.gcp,
                token,
                cfg.retry.policy(),
            )?))
        }
        "mock" => {
            // Local dry runs: the mock knows the configured zones.
            let zones: Vec<String> = llmvm_common::parse_zone_priority(&cfg.gcp.zone_priority)?
                .into_iter()
                .flat_map(|g| g.zones)
                .filter(|z| z != ZONE_WILDCARD)
                .collect();
            let zone_refs: Vec<&str> = zones.iter().map(|z| z.as_str()).collect();
            Ok(Arc::new(llmvm_providers::mock::MockCompute::new(&zone_refs)))
        }
        other => bail!("unknown provider '{}'", other),
    }
}

fn build_manager(cfg: &Config, compute: Arc<dyn CloudCompute>) -> anyhow::Result<LifecycleManager> {
    let policy = cfg.retry.policy();
    let firewall = FirewallManager::new(
        compute.clone(),
        cfg.my_ip_url.clone(),
        cfg.gcp.firewall_rule_name.clone(),
        cfg.ollama_port,
        policy,
    )?;
    let shell = Arc::new(SshConnector::new(&cfg.ssh));
    let provisioner = RemoteProvisioner::new(shell, OllamaApi::new(cfg.ollama_port)?, policy);
    Ok(LifecycleManager::new(compute, firewall, provisioner, policy))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    init_tracing(cli.verbose, cfg.log_level.as_deref());
    tracing::debug!(config = %cli.config.display(), "configuration loaded");

    let compute = build_compute(&cfg)?;
    let manager = build_manager(&cfg, compute)?;

    match cli.command {
        Command::Create { name, model } => {
            let spec = cfg.instance_spec(name.as_deref(), model.as_deref())?;
            match manager.create(&spec).await? {
                CreateOutcome::AlreadyExists(record) => {
                    println!(
                        "instance '{}' already exists in zone {} ({})",
                        record.name,
                        record.zone.as_deref().unwrap_or("unknown"),
                        record.status
                    );
                }
                CreateOutcome::Provisioned(result) => {
                    println!(
                        "instance '{}' is up at {} (model {}, ready: {}, took {:.0?})",
                        result.instance, result.ip, result.model, result.ready, result.elapsed
                    );
                    if result.ready {
                        println!(
                            "Ollama is available at http://{}:{}",
                            result.ip, cfg.ollama_port
                        );
                    }
                }
            }
        }
        Command::Start { name } => {
            let name = name.as_deref().unwrap_or(&cfg.gcp.instance_name);
            let record = manager.start(name).await?;
            println!(
                "instance '{}' is {} at {}",
                record.name,
                record.status,
                record.external_ip.as_deref().unwrap_or("no external IP")
            );
        }
        Command::Stop { name } => {
            let name = name.as_deref().unwrap_or(&cfg.gcp.instance_name);
            let record = manager.stop(name).await?;
            println!("instance '{}' is {}", record.name, record.status);
        }
        Command::Delete { name } => {
            let name = name.as_deref().unwrap_or(&cfg.gcp.instance_name);
            manager.delete(name).await?;
            println!("instance '{}' is gone", name);
        }
        Command::List => {
            let records = manager.list().await?;
            if records.is_empty() {
                println!("no instances");
            } else {
                println!("{:<24} {:<20} {:<10} {:<16}", "NAME", "ZONE", "STATUS", "EXTERNAL IP");
                for record in records {
                    println!(
                        "{:<24} {:<20} {:<10} {:<16}",
                        record.name,
                        record.zone.as_deref().unwrap_or("-"),
                        record.status.to_string(),
                        record.external_ip.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }
    Ok(())
}
