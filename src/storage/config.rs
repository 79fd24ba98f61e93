//! # Storage Configuration
//!
//! This module defines the `[database]` section of the configuration file.
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;

use crate::config::{InsertConfigRoot, resolve_path};

fn default_max_connections() -> u32 {
    10
}

/// The storage backend and its connection parameters.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum Database {
    Sqlite(SqliteConfig),
    Mysql(MysqlConfig),
}

/// Connection parameters for a SQLite database file.
#[derive(Deserialize, Debug, Clone)]
pub struct SqliteConfig {
    /// The database file, created if missing.
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Directory with migration scripts, overriding the embedded ones.
    #[serde(default)]
    pub migrations_dir: Option<PathBuf>,
}

/// Connection parameters for a MySQL server.
#[derive(Deserialize, Debug, Clone)]
pub struct MysqlConfig {
    /// `host` or `host:port`.
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// The database (schema) name.
    pub schema: String,
    #[serde(default)]
    pub tls: Option<MysqlTls>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Directory with migration scripts, overriding the embedded ones.
    #[serde(default)]
    pub migrations_dir: Option<PathBuf>,
}

/// TLS settings for the MySQL connection.
#[derive(Deserialize, Debug, Clone)]
pub struct MysqlTls {
    /// CA bundle used to verify the server.
    pub ca_cert: PathBuf,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl Database {
    /// The configured migrations directory, if any.
    pub fn migrations_dir(&self) -> Option<&Path> {
        match self {
            Database::Sqlite(c) => c.migrations_dir.as_deref(),
            Database::Mysql(c) => c.migrations_dir.as_deref(),
        }
    }
}

impl InsertConfigRoot for Database {
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()> {
        match self {
            Database::Sqlite(c) => {
                resolve_path(config_root, &mut c.path);
                if let Some(dir) = c.migrations_dir.as_mut() {
                    resolve_path(config_root, dir);
                }
            }
            Database::Mysql(c) => {
                if let Some(tls) = c.tls.as_mut() {
                    resolve_path(config_root, &mut tls.ca_cert);
                    if let Some(cert) = tls.client_cert.as_mut() {
                        resolve_path(config_root, cert);
                    }
                    if let Some(key) = tls.client_key.as_mut() {
                        resolve_path(config_root, key);
                    }
                }
                if let Some(dir) = c.migrations_dir.as_mut() {
                    resolve_path(config_root, dir);
                }
            }
        }
        Ok(())
    }

    fn check_paths(&self) -> Result<()> {
        if let Some(dir) = self.migrations_dir() {
            if !dir.is_dir() {
                anyhow::bail!("migrations directory {:?} not found", dir);
            }
        }
        if let Database::Mysql(MysqlConfig { tls: Some(tls), .. }) = self {
            if !tls.ca_cert.exists() {
                anyhow::bail!("MySQL CA certificate {:?} not found", tls.ca_cert);
            }
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                anyhow::bail!("MySQL client_cert and client_key must be set together");
            }
        }
        Ok(())
    }
}
