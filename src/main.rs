use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use datagate::audit::AuditSync;
use datagate::auth::TokenGenerator;
use datagate::catalog::{SqliteStore, Store};
use datagate::config::Settings;
use datagate::lock::StoreLock;
use datagate::pg::TokioPgConnector;
use datagate::publish::CredentialPublisher;
use datagate::reconcile::Reconciler;
use datagate::server::{AppState, create_router};
use datagate::types::Token;

fn create_admin_token(generator: &TokenGenerator) -> anyhow::Result<(Token, String)> {
    let (raw_token, lookup, hash) = generator.generate()?;
    let token = Token {
        id: Uuid::new_v4().to_string(),
        token_hash: hash,
        token_lookup: lookup,
        is_admin: true,
        principal_id: None,
        created_at: Utc::now(),
        expires_at: None,
        last_used_at: None,
    };
    Ok((token, raw_token))
}

#[cfg(unix)]
fn set_restrictive_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set permissions on {}: {e}", path.display());
    }
}

#[derive(Parser)]
#[command(name = "datagate")]
#[command(about = "Database access reconciler and streaming query gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve {
        /// Path to the settings file
        #[arg(long, short, default_value = "datagate.toml")]
        config: PathBuf,

        /// Host to bind to (overrides the settings file)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (overrides the settings file)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Run one audit-log ingestion pass and exit
    SyncAudit {
        /// Path to the settings file
        #[arg(long, short, default_value = "datagate.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Initialize the service (create catalog database and admin token)
    Init {
        /// Data directory for the catalog database
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },
}

fn run_init(data_dir: String) -> anyhow::Result<()> {
    let data_path: PathBuf = data_dir.into();
    fs::create_dir_all(&data_path)?;

    let db_path = data_path.join("datagate.db");
    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;

    let token_file = data_path.join(".admin_token");

    if store.has_admin_token()? {
        bail!(
            "Service already initialized. Admin token exists at: {}",
            token_file.display()
        );
    }

    let generator = TokenGenerator::new();
    let (token, raw_token) = create_admin_token(&generator)?;

    store.create_token(&token)?;
    fs::write(&token_file, &raw_token)?;

    #[cfg(unix)]
    set_restrictive_permissions(&token_file);

    println!();
    println!("========================================");
    println!("Admin token (save this, it won't be shown again):");
    println!();
    println!("  {raw_token}");
    println!();
    println!("Token also written to: {}", token_file.display());
    println!("========================================");
    println!();

    Ok(())
}

async fn run_serve(config: PathBuf, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut settings = Settings::load(&config)?;
    if let Some(host) = host {
        settings.host = host;
    }
    if let Some(port) = port {
        settings.port = port;
    }
    let settings = Arc::new(settings);

    let token_file = settings.data_dir.join(".admin_token");
    if !token_file.exists() {
        bail!(
            "Service not initialized. Run 'datagate admin init' first to create the catalog database and admin token."
        );
    }

    let store = SqliteStore::new(settings.db_path())?;
    if !store.has_admin_token()? {
        bail!(
            "Service not initialized. Run 'datagate admin init' first to create the catalog database and admin token."
        );
    }

    info!("Admin token available at {}", token_file.display());

    let store: Arc<dyn Store> = Arc::new(store);
    let lock = Arc::new(StoreLock::new(store.clone()));
    let connector = Arc::new(TokioPgConnector);
    let reconciler = Reconciler::new(
        settings.clone(),
        store.clone(),
        lock,
        connector.clone(),
    );
    let publisher = CredentialPublisher::new(settings.notebooks_bucket.clone()).await;

    let audit = AuditSync::new(settings.clone(), store.clone(), connector);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(datagate::audit::MIN_INTERVAL).await;
            if let Err(e) = audit.run().await {
                warn!("audit sync failed: {e}");
            }
        }
    });

    let state = Arc::new(AppState {
        settings: settings.clone(),
        store,
        reconciler,
        publisher,
    });

    let app = create_router(state);
    let addr = settings.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_sync_audit(config: PathBuf) -> anyhow::Result<()> {
    let settings = Arc::new(Settings::load(&config)?);

    let store = SqliteStore::new(settings.db_path())?;
    store.initialize()?;
    let store: Arc<dyn Store> = Arc::new(store);

    let audit = AuditSync::new(settings, store, Arc::new(TokioPgConnector));
    let inserted = audit.run().await?;
    info!("ingested {inserted} audit rows");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("datagate=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init { data_dir } => {
                run_init(data_dir)?;
            }
        },
        Commands::Serve { config, host, port } => {
            run_serve(config, host, port).await?;
        }
        Commands::SyncAudit { config } => {
            run_sync_audit(config).await?;
        }
    }

    Ok(())
}
