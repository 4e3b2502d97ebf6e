//! Pie CLI
//!
//! Runs tracker nodes and tracker lookups on the Pie overlay.

mod config;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use pie_core::{Certificate, Context, Id};
use pie_discovery::{Responder, RoutingTable, Tracker};
use pie_transport::{QuicConnector, QuicListener, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::Config;

/// Pie - peer-to-peer tracker overlay
#[derive(Parser)]
#[command(name = "pie")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new certificate and key
    Keygen {
        /// Overwrite an existing identity
        #[arg(long)]
        force: bool,
    },

    /// Print the node identifier
    Id,

    /// Run a tracker node
    Listen {
        /// Listen address, overriding the configuration
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Look up trackers near an identifier
    Find {
        /// Target identifier (hex)
        #[arg(required = true)]
        target: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::load_or_default()?,
    };
    config.validate()?;
    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Keygen { force } => generate_identity(&config, force),
        Commands::Id => show_id(&config),
        Commands::Listen { bind } => run_tracker(&config, bind).await,
        Commands::Find { target } => find(&config, &target).await,
    }
}

fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

fn load_identity(config: &Config) -> anyhow::Result<Arc<Certificate>> {
    let cert_pem = std::fs::read_to_string(&config.node.cert_file).with_context(|| {
        format!(
            "failed to read {} (run `pie keygen` first)",
            config.node.cert_file.display()
        )
    })?;
    let key_pem = std::fs::read_to_string(&config.node.key_file)
        .with_context(|| format!("failed to read {}", config.node.key_file.display()))?;
    Ok(Arc::new(Certificate::from_pem(&cert_pem, &key_pem)?))
}

/// Generate and store a new node identity
fn generate_identity(config: &Config, force: bool) -> anyhow::Result<()> {
    let cert_path = &config.node.cert_file;
    let key_path = &config.node.key_file;
    if !force && (cert_path.exists() || key_path.exists()) {
        anyhow::bail!(
            "identity already exists at {} (use --force to replace it)",
            cert_path.display()
        );
    }

    println!("Generating new ed25519 certificate...");
    let generated = Certificate::generate()?;
    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(cert_path, &generated.cert_pem)?;
    std::fs::write(key_path, &generated.key_pem)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    println!("Node id: {}", generated.certificate.id());
    println!("Certificate saved to: {}", cert_path.display());
    println!("Private key saved to: {}", key_path.display());
    Ok(())
}

fn show_id(config: &Config) -> anyhow::Result<()> {
    println!("{}", load_identity(config)?.id());
    Ok(())
}

fn seeds(config: &Config) -> Vec<Arc<Tracker>> {
    config
        .discovery
        .bootstrap
        .iter()
        .map(|addr| Arc::new(Tracker::unknown(vec![addr.clone()])))
        .collect()
}

/// Run a tracker node until Ctrl+C
async fn run_tracker(config: &Config, bind: Option<String>) -> anyhow::Result<()> {
    let cert = load_identity(config)?;
    let addr = bind.unwrap_or_else(|| config.network.listen_addr.clone());
    let discovery = config.discovery_config(cert.id());
    discovery.validate()?;

    let listener = QuicListener::bind(&addr, &cert)?;
    let connector = Arc::new(listener.connector());
    let server = Arc::new(Server::new(Arc::new(listener), cert.der().to_vec()));
    let table = Arc::new(RoutingTable::new(connector, discovery, Some(Arc::clone(&cert))));

    println!("Pie tracker");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Node id: {}", cert.id());
    println!("Listen: {}", server.local_addr());

    let (ctx, cancel) = Context::with_cancel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to wait for Ctrl+C: {}", e);
            return;
        }
        println!("\nShutting down...");
        cancel.cancel();
    });

    let connected = table.bootstrap(&ctx, seeds(config)).await;
    tracing::info!("Connected to {} of {} bootstrap trackers", connected, config.discovery.bootstrap.len());

    let responder = Arc::new(Responder::new(Arc::clone(&table), Arc::clone(&server)));
    responder.serve(&ctx).await;
    server.close();
    Ok(())
}

/// Bootstrap, look up `target` and print the resulting table
async fn find(config: &Config, target: &str) -> anyhow::Result<()> {
    let target = Id::from_hex(target).context("invalid target identifier")?;
    let cert = load_identity(config)?;
    let discovery = config.discovery_config(cert.id());
    let (fanout, request_timeout) = (discovery.fanout, discovery.request_timeout);

    let connector = Arc::new(QuicConnector::bind_client()?);
    let table = Arc::new(RoutingTable::new(connector, discovery, Some(cert)));
    let ctx = Context::background();

    let connected = table.bootstrap(&ctx, seeds(config)).await;
    if connected == 0 {
        anyhow::bail!("no bootstrap tracker reachable");
    }

    let outcome = table
        .find_tracker(&ctx, &target, fanout, request_timeout)
        .await?;
    println!(
        "Lookup finished after {} rounds, {} trackers queried",
        outcome.rounds,
        outcome.visited.len()
    );
    println!();
    println!("Nearest trackers:");
    for tracker in table.nearest(&target, fanout, None) {
        println!("  {}  {}", tracker.id(), tracker.addr_json());
    }
    println!();
    println!("Known trackers: {}", table.len());

    for tracker in table.trackers() {
        tracker.disconnect();
    }
    Ok(())
}
