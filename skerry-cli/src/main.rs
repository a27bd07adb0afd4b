//! Skerry CLI
//!
//! Command-line client for a Skerry storage network.
//!
//! # Commands
//! - `register` - Generate a keypair and register with the metaserver
//! - `upload` / `download` - Move files in and out of the network
//! - `mkdir`, `ls`, `versions`, `rm` - Namespace management
//! - `share` / `unshare` - Grant and revoke read access
//! - `status` - Show available storage

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use skerry_core::crypto::{fingerprint_key, generate_keypair};
use skerry_core::types::RenterInfo;
use skerry_metaserver::Client;
use skerry_provider::HttpBlockStore;
use skerry_renter::{ContractFreelist, Renter, RenterConfig, StorageManager, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;

/// How often the storage cache is refreshed from the metaserver.
const FREELIST_REFRESH: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "skerry")]
#[command(about = "Skerry decentralized storage CLI")]
#[command(version)]
struct Cli {
    /// Metaserver URL (overrides the config file)
    #[arg(long, global = true)]
    metaserver: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a keypair and register this renter with the metaserver
    Register {
        /// Human-readable alias for the directory record
        alias: String,
    },

    /// Upload a file or directory
    Upload {
        /// Path to the local file or directory
        src: PathBuf,

        /// Name within the renter's namespace (default: source name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Download a file or directory
    Download {
        /// File id to download
        file_id: String,

        /// Version number (default: newest)
        #[arg(short, long)]
        version: Option<u32>,

        /// Destination path (default: home directory)
        #[arg(short, long)]
        dest: Option<PathBuf>,
    },

    /// Create a folder record
    Mkdir {
        /// Folder name within the renter's namespace
        name: String,
    },

    /// Grant another renter read access to a file
    Share {
        file_id: String,
        /// The grantee's renter id
        user_id: String,
    },

    /// Revoke a previously granted permission
    Unshare {
        file_id: String,
        user_id: String,
    },

    /// List stored files
    Ls {
        /// Include files shared by other renters
        #[arg(short, long)]
        shared: bool,
    },

    /// List the version history of a file
    Versions { file_id: String },

    /// Remove a file, or a single version of it
    Rm {
        file_id: String,

        /// Remove only this version number
        #[arg(short, long)]
        version: Option<u32>,
    },

    /// Show storage status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config()?;
    if let Some(url) = &cli.metaserver {
        cfg.metaserver.url = url.clone();
    }

    match cli.command {
        Commands::Register { alias } => register(&cfg, &alias).await,
        command => {
            let renter = connect(&cfg).await?;
            run(&renter, command).await
        }
    }
}

/// Generate and store a keypair, then create the directory record.
async fn register(cfg: &config::CliConfig, alias: &str) -> Result<()> {
    if cfg.renter.id.is_some() {
        anyhow::bail!("already registered; remove ~/.skerry to start over");
    }
    println!("Generating 2048-bit RSA keypair...");
    let (private_key, public_key) = generate_keypair()?;
    config::save_private_key(&private_key)?;

    let client = Client::new(&cfg.metaserver.url)?;
    let info = RenterInfo {
        id: fingerprint_key(&public_key)?,
        alias: alias.to_string(),
        public_key: public_key_pem(&public_key)?,
    };
    let registered = client
        .register_renter(&info)
        .await
        .context("registration rejected by metaserver")?;

    let mut cfg = cfg.clone();
    cfg.renter.id = Some(registered.id.clone());
    cfg.renter.alias = Some(alias.to_string());
    config::save_config(&cfg)?;

    println!("Registered renter {} ({alias})", registered.id);
    Ok(())
}

fn public_key_pem(key: &rsa::RsaPublicKey) -> Result<String> {
    use rsa::pkcs8::EncodePublicKey;
    key.to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .context("failed to encode public key")
}

/// Authorize against the metaserver and wire up a renter session.
async fn connect(cfg: &config::CliConfig) -> Result<Renter> {
    let renter_id = cfg
        .renter
        .id
        .clone()
        .context("not registered; run `skerry register <alias>` first")?;
    let private_key = config::load_private_key()?;

    let client = Arc::new(Client::new(&cfg.metaserver.url)?);
    client
        .authorize_renter(&private_key, &renter_id)
        .await
        .context("metaserver authorization failed")?;

    let blocks = Arc::new(HttpBlockStore::new(client.token())?);
    let freelist = Arc::new(ContractFreelist::new(client.clone(), renter_id.clone()));
    let storage = Arc::new(StorageManager::new(
        Vec::new(),
        freelist,
        FREELIST_REFRESH,
        Arc::new(SystemClock),
        StdRng::from_entropy(),
    ));

    let mut renter_config = RenterConfig::new(
        renter_id,
        cfg.renter.alias.clone().unwrap_or_default(),
    );
    renter_config.data_blocks = cfg.renter.data_blocks;
    renter_config.parity_blocks = cfg.renter.parity_blocks;

    Ok(Renter::new(
        renter_config,
        private_key,
        client,
        blocks,
        storage,
    ))
}

async fn run(renter: &Renter, command: Commands) -> Result<()> {
    match command {
        Commands::Register { .. } => unreachable!("handled before connect"),

        Commands::Upload { src, name } => {
            let results = renter.upload(&src, name.as_deref()).await?;
            for info in &results {
                if info.is_dir {
                    println!("created folder {} ({})", info.name, info.file_id);
                } else {
                    println!(
                        "uploaded {} -> {} (version {}, {} blocks, {} ms)",
                        info.name,
                        info.file_id,
                        info.version_num,
                        info.blocks.len(),
                        info.total_time_ms
                    );
                }
            }
        }

        Commands::Download {
            file_id,
            version,
            dest,
        } => {
            let info = renter.download(&file_id, dest, version).await?;
            for file in &info.files {
                let failed = file.blocks.iter().filter(|b| b.error.is_some()).count();
                if file.is_dir {
                    println!("created {}", file.dest_path);
                } else if failed > 0 {
                    println!(
                        "downloaded {} -> {} ({} ms, recovered from {} lost blocks)",
                        file.name, file.dest_path, file.total_time_ms, failed
                    );
                } else {
                    println!(
                        "downloaded {} -> {} ({} ms)",
                        file.name, file.dest_path, file.total_time_ms
                    );
                }
            }
        }

        Commands::Mkdir { name } => {
            let record = renter.create_dir(&name).await?;
            println!("created folder {} ({})", record.name, record.id);
        }

        Commands::Share { file_id, user_id } => {
            renter.share(&file_id, &user_id).await?;
            println!("shared {file_id} with {user_id}");
        }

        Commands::Unshare { file_id, user_id } => {
            renter.unshare(&file_id, &user_id).await?;
            println!("unshared {file_id} from {user_id}");
        }

        Commands::Ls { shared } => {
            let files = renter.list_files().await?;
            print_files(&files);
            if shared {
                let shared_files = renter.list_shared_files().await?;
                if !shared_files.is_empty() {
                    println!("--- shared with you ---");
                    print_files(&shared_files);
                }
            }
        }

        Commands::Versions { file_id } => {
            let file = renter
                .list_files()
                .await?
                .into_iter()
                .find(|f| f.id == file_id)
                .context("no such file")?;
            for version in &file.versions {
                println!(
                    "{:>4}  {:>12} bytes  {} data + {} parity  {}",
                    version.num,
                    version.size,
                    version.num_data_blocks,
                    version.num_parity_blocks,
                    version
                        .upload_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default()
                );
            }
        }

        Commands::Rm { file_id, version } => match version {
            Some(num) => {
                renter.remove_version(&file_id, num).await?;
                println!("removed version {num} of {file_id}");
            }
            None => {
                renter.remove_file(&file_id).await?;
                println!("removed {file_id}");
            }
        },

        Commands::Status => {
            let available = renter.available_storage().await;
            println!("renter id:         {}", renter.config().renter_id);
            println!(
                "coding:            {} data + {} parity",
                renter.config().data_blocks,
                renter.config().parity_blocks
            );
            println!("available storage: {}", format_bytes(available));
        }
    }
    Ok(())
}

fn print_files(files: &[skerry_core::types::File]) {
    for file in files {
        if file.is_dir {
            println!("{}  {}/", file.id, file.name);
        } else {
            let size = file.latest_version().map(|v| v.size).unwrap_or(0);
            println!(
                "{}  {}  {} ({} versions)",
                file.id,
                file.name,
                format_bytes(size),
                file.versions.len()
            );
        }
    }
}

/// Format bytes as a human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}
