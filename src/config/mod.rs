//! # Configuration
//!
//! This module handles the reading and parsing of the main configuration file.
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

use crate::certificat_authority::config::{Ca, Server};
use crate::storage::config::Database;

/// The main configuration for the host CA.
#[derive(Deserialize, Debug)]
pub struct Config {
    /// The Certificate Authority (CA) configuration.
    pub ca: Ca,
    /// The storage backend configuration.
    pub database: Database,
    /// The enrollment socket configuration.
    pub server: Server,
}

/// A trait for inserting the configuration root path into a configuration struct.
///
/// This is used to resolve relative paths in the configuration.
pub(crate) trait InsertConfigRoot {
    /// Inserts the configuration root path into the configuration struct.
    ///
    /// # Arguments
    ///
    /// * `config_root` - The root path of the configuration file.
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()>;
    /// Checks if the paths in the configuration are valid.
    fn check_paths(&self) -> Result<()>;
}

/// Makes a relative `path` relative to `config_root`.
pub(crate) fn resolve_path(config_root: &PathBuf, path: &mut PathBuf) {
    if !path.has_root() {
        let mut resolved = config_root.clone();
        resolved.push(&*path);
        *path = resolved;
    }
}

/// Reads and parses the main configuration file.
///
/// # Arguments
///
/// * `file_path` - The path to the configuration file.
///
/// # Returns
///
/// A `Result` containing the parsed `Config` or an error.
pub fn read_config(file_path: &str) -> Result<Config> {
    let config_path: PathBuf = PathBuf::from(file_path);
    if !config_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Config file {} not found", file_path),
        )
        .into());
    }
    let config_root = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();

    let mut config_file = File::open(file_path)?;
    let mut config = String::new();
    let _ = config_file.read_to_string(&mut config)?;

    let mut config: Config = toml::from_str(&config)?;
    config.ca.insert_config_path(&config_root)?;
    config.ca.check_paths()?;
    config.database.insert_config_path(&config_root)?;
    config.database.check_paths()?;
    config.server.insert_config_path(&config_root)?;
    config.server.check_paths()?;

    Ok(config)
}
