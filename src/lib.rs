use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use log::{error, info};
use serde::Deserialize;

pub mod auth_gate;
pub mod certificat_authority;
pub mod config;
pub mod storage;

use crate::certificat_authority::{
    CertificateAuthority, ca_server::CaServer, enrollment::IssuanceService,
};
use crate::storage::StorageError;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// config file path
    #[arg(short = 'c', long)]
    config_file: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve enrollment requests on the CA socket
    Serve,
    /// Apply pending database migrations
    Migrate {
        /// directory with migration scripts, instead of the built-in ones
        #[arg(long)]
        migrations_dir: Option<PathBuf>,
    },
    /// Print all recorded host keys in known_hosts format
    KnownHosts {
        /// also print a @cert-authority line for the CA key
        #[arg(long, default_value_t = false)]
        with_ca: bool,
    },
    /// Replace the identity mappings with the [mappings] table of a TOML file
    SyncMappings {
        /// mapping file
        file: PathBuf,
    },
    /// Look up the username mapped to an identity
    LookupMapping {
        /// identity to look up
        identity: String,
    },
}

#[derive(Deserialize, Debug)]
struct MappingFile {
    #[serde(default)]
    mappings: HashMap<String, String>,
}

pub async fn run(args: CliArgs) -> Result<()> {
    if env::var("RUST_LOG").is_err() {
        // this is unsafe as this programm is multi threaded, but at this time no other
        // thread reads the environment
        unsafe {
            env::set_var("RUST_LOG", "info");
        }
    }
    let _ = env_logger::try_init();

    let config = config::read_config(&args.config_file)
        .with_context(|| format!("failed to read config file {}", args.config_file))?;
    let storage = storage::connect(&config.database).await?;

    match args.command {
        Command::Serve => {
            if config.server.auto_migrate {
                storage.migrate(config.database.migrations_dir()).await?;
            }
            let ca = Arc::new(CertificateAuthority::new(&config.ca)?);
            info!(
                "loaded CA key {}",
                ca.public_key().fingerprint(ssh_key::HashAlg::Sha256)
            );
            let allowed_uids = config
                .server
                .allowed_uids
                .clone()
                .unwrap_or_else(|| vec![nix::unistd::getuid().as_raw()]);
            let service = IssuanceService::new(ca, storage);
            let server = CaServer::new(config.server.socket_path.clone(), service, allowed_uids);

            let result = tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("received interrupt, shutting down");
                    Ok(())
                }
            };
            info!("Removing CA socket file: {}", config.server.socket_path);
            let _ = fs::remove_file(&config.server.socket_path);
            result
        }
        Command::Migrate { migrations_dir } => {
            let migrations_dir = migrations_dir
                .as_deref()
                .or(config.database.migrations_dir());
            storage.migrate(migrations_dir).await?;
            info!("migrations applied");
            Ok(())
        }
        Command::KnownHosts { with_ca } => {
            if with_ca {
                let ca = CertificateAuthority::new(&config.ca)?;
                println!("@cert-authority * {}", ca.public_key().to_openssh()?);
            }
            let mut host_keys = storage.query_host_keys();
            while let Some(host_key) = host_keys.try_next().await? {
                println!("{} {}", host_key.hostname, host_key.public_key);
            }
            Ok(())
        }
        Command::SyncMappings { file } => {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("failed to read mapping file {:?}", file))?;
            let mapping_file: MappingFile = toml::from_str(&content)?;
            storage
                .record_identity_mapping(&mapping_file.mappings)
                .await?;
            info!(
                "stored {} identity mappings",
                mapping_file.mappings.len()
            );
            Ok(())
        }
        Command::LookupMapping { identity } => {
            match storage.query_identity_mapping(&identity).await {
                Ok(username) => {
                    println!("{}", username);
                    Ok(())
                }
                Err(StorageError::NotFound(identity)) => {
                    error!("no mapping for {}", identity);
                    Err(StorageError::NotFound(identity).into())
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}
