//! warden daemon
//!
//! Loads the configuration snapshot, wires the service graph, and runs the
//! mTLS API server. Also hosts the operator subcommands for certificate and
//! permission inspection and slashing-protection export/import.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use warden_core::checker::Checker;
use warden_core::config::{Config, PeerConfig};
use warden_core::fetcher::Fetcher;
use warden_core::lister::Lister;
use warden_core::locker::Locker;
use warden_core::manager::{AccountManager, WalletManager};
use warden_core::observer::TracingObserver;
use warden_core::rules::{ProtectionExport, RulesEngine, RulesStore};
use warden_core::ruler::Ruler;
use warden_core::signer::{DistributedSigner, SignerService};
use warden_core::store::{FilesystemStore, Store};
use warden_core::unlocker::Unlocker;
use warden_node::tls::{describe_certificate, TlsMaterial};
use warden_node::{ApiServer, AppState, Peers, Process, ProcessOptions, Sender};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Distributed remote signer for validator keys", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signer (the default)
    Run,

    /// Show the configured server certificate and exit
    ShowCertificates,

    /// Show the parsed client permissions and exit
    ShowPermissions,

    /// Write slashing-protection data as JSON to stdout or a file
    ExportSlashingProtection {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load slashing-protection data from a JSON file
    ImportSlashingProtection {
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder().with_max_level(Level::INFO).init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::ShowCertificates => show_certificates(&config),
        Commands::ShowPermissions => show_permissions(&config),
        Commands::ExportSlashingProtection { output } => export_protection(&config, output),
        Commands::ImportSlashingProtection { input } => import_protection(&config, &input),
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        server = %config.server.name,
        id = config.server.id,
        version = warden_core::VERSION,
        "starting warden"
    );

    let store: Arc<dyn Store> = Arc::new(
        FilesystemStore::open(config.wallet_path()).context("opening keystore")?,
    );
    let checker = Arc::new(Checker::new(config.permissions.clone()).context("parsing permissions")?);
    let fetcher = Arc::new(
        Fetcher::new(vec![Arc::clone(&store)])
            .await
            .context("indexing accounts")?,
    );
    let unlocker = Arc::new(Unlocker::new(
        config.unlocker.account_passphrases.clone(),
        config.unlocker.wallet_passphrases.clone(),
    ));
    let rules = Arc::new(RulesEngine::new(
        RulesStore::open(config.rules_path()).context("opening slashing-protection store")?,
        config.server.rules.admin_ips.clone(),
    ));
    let ruler = Arc::new(Ruler::new(Arc::new(Locker::new()), rules));
    let signer = Arc::new(SignerService::new(
        Arc::clone(&checker),
        Arc::clone(&fetcher),
        Arc::clone(&unlocker),
        Arc::clone(&ruler),
        Arc::new(TracingObserver),
    ));
    let lister = Lister::new(Arc::clone(&checker), Arc::clone(&fetcher));
    let accounts = AccountManager::new(
        Arc::clone(&store),
        Arc::clone(&checker),
        Arc::clone(&fetcher),
        Arc::clone(&unlocker),
        Arc::clone(&ruler),
    );
    let wallets = WalletManager::new(Arc::clone(&store), Arc::clone(&checker));

    let tls = Arc::new(
        TlsMaterial::load(
            &config.certificates.server_cert,
            &config.certificates.server_key,
            &config.certificates.ca_cert,
        )
        .context("loading TLS material")?,
    );

    // A server with no peers configured still participates as a cluster of
    // one, so the directory always contains at least itself.
    let mut peer_map = config.peer_ids()?;
    if peer_map.is_empty() {
        peer_map.insert(
            config.server.id,
            PeerConfig {
                name: config.server.name.clone(),
                address: config.server.listen_address.clone(),
            },
        );
    }
    let peers = Arc::new(Peers::new(config.server.id, &peer_map)?);
    let sender = Arc::new(Sender::new(
        Arc::clone(&tls),
        Duration::from_secs(5),
        Duration::from_secs(30),
    ));
    let process = Process::new(
        Arc::clone(&peers),
        sender,
        Arc::clone(&checker),
        Arc::clone(&fetcher),
        Arc::clone(&signer),
        Arc::clone(&store),
        config.process.generation_passphrase.clone(),
        ProcessOptions::default(),
    );
    signer.set_distributed_signer(Arc::clone(&process) as Arc<dyn DistributedSigner>);

    let state = Arc::new(AppState {
        signer,
        lister,
        accounts,
        wallets,
        process,
        peers,
        ready: AtomicBool::new(false),
        started_at: Instant::now(),
    });

    ApiServer::new(state, tls, config.server.listen_address.clone())
        .serve()
        .await
        .context("server failed")
}

fn show_certificates(config: &Config) -> Result<()> {
    let tls = TlsMaterial::load(
        &config.certificates.server_cert,
        &config.certificates.server_key,
        &config.certificates.ca_cert,
    )?;
    println!("{}", describe_certificate(tls.leaf())?);
    Ok(())
}

fn show_permissions(config: &Config) -> Result<()> {
    let checker = Checker::new(config.permissions.clone())?;
    let mut clients = checker.clients();
    clients.sort_unstable();
    for client in clients {
        println!("{client}:");
        for permission in checker.permissions(client) {
            let operations: Vec<String> = permission
                .operations
                .iter()
                .map(|op| op.to_string())
                .collect();
            println!("  {} => {}", permission.path, operations.join(", "));
        }
    }
    Ok(())
}

fn export_protection(config: &Config, output: Option<PathBuf>) -> Result<()> {
    let store = RulesStore::open(config.rules_path())?;
    let export = store.export();
    let json = serde_json::to_string_pretty(&export)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("exported {} records to {}", export.records.len(), path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn import_protection(config: &Config, input: &PathBuf) -> Result<()> {
    let data =
        std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let export: ProtectionExport = serde_json::from_slice(&data)?;
    let store = RulesStore::open(config.rules_path())?;
    let imported = store.import(&export)?;
    eprintln!("imported {imported} slashing-protection records");
    Ok(())
}
