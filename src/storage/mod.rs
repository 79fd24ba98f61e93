//! # Storage
//!
//! Durable bookkeeping of the keys the CA has certified.
//!
//! Each principal has at most one current row per certificate type. Every
//! issuance appends to an audit log whose auto-increment id becomes the
//! certificate serial, so a re-enrolled principal always gets a fresh serial.
//! The backend (SQLite or MySQL) is picked once at startup from the
//! configuration and handed around as `Arc<dyn Storage>`.
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use log::info;
use ssh_key::PublicKey;
use ssh_key::certificate::CertType;
use thiserror::Error;

/// Configuration types for the storage backends.
pub mod config;
mod mysql;
mod sqlite;

pub use mysql::MysqlStorage;
pub use sqlite::SqliteStorage;

/// Rows are inserted in chunks of this size to stay below the bind parameter
/// limits of both backends.
const MAPPING_CHUNK_SIZE: usize = 500;

const HOST_CERT: &str = "host_cert";
const USER_CERT: &str = "user_cert";

/// Errors that can occur while talking to the storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested entry does not exist.
    #[error("no entry found for {0}")]
    NotFound(String),
    /// The backend configuration is unusable.
    #[error("invalid database configuration: {0}")]
    Config(String),
    /// The public key could not be converted to its authorized-key form.
    #[error("failed to encode public key: {0}")]
    Encoding(#[from] ssh_key::Error),
    /// Connectivity problems, constraint violations and the like.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Loading or applying schema migrations failed.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// A host key as recorded by the last enrollment of that host.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HostKey {
    pub hostname: String,
    /// The key in authorized-key form, without comment.
    #[sqlx(rename = "pubkey")]
    pub public_key: String,
}

/// The capability set every storage backend provides.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Records that `public_key` is being certified for `principal` and
    /// returns the serial to put into the certificate.
    ///
    /// The row keyed by `(principal, cert_type)` is inserted or has its key
    /// replaced. The returned serial is freshly allocated for this call and is
    /// the value stored in the row once the write has committed.
    async fn record_issuance(
        &self,
        cert_type: CertType,
        principal: &str,
        public_key: &PublicKey,
    ) -> Result<u64, StorageError>;

    /// Streams every recorded host key. Each call re-reads the table.
    fn query_host_keys(&self) -> BoxStream<'_, Result<HostKey, StorageError>>;

    /// Replaces the whole identity mapping table with `mapping` in a single
    /// transaction.
    async fn record_identity_mapping(
        &self,
        mapping: &HashMap<String, String>,
    ) -> Result<(), StorageError>;

    /// Looks up the external username for `identity`.
    async fn query_identity_mapping(&self, identity: &str) -> Result<String, StorageError>;

    /// Applies pending migrations, either from `migrations_dir` or from the
    /// scripts embedded at build time.
    async fn migrate(&self, migrations_dir: Option<&Path>) -> Result<(), StorageError>;
}

/// Connects to the backend selected by the configuration.
pub async fn connect(database: &config::Database) -> Result<Arc<dyn Storage>, StorageError> {
    match database {
        config::Database::Sqlite(sqlite_config) => {
            info!("using sqlite storage at {:?}", sqlite_config.path);
            Ok(Arc::new(SqliteStorage::connect(sqlite_config).await?))
        }
        config::Database::Mysql(mysql_config) => {
            info!(
                "using mysql storage at {}/{}",
                mysql_config.address, mysql_config.schema
            );
            Ok(Arc::new(MysqlStorage::connect(mysql_config).await?))
        }
    }
}

/// Encodes a public key the way it is stored: `<type> <base64>` with the
/// comment dropped, so the same key always yields the same text.
pub fn authorized_key(public_key: &PublicKey) -> Result<String, ssh_key::Error> {
    PublicKey::new(public_key.key_data().clone(), "").to_openssh()
}

fn cert_type_column(cert_type: CertType) -> &'static str {
    match cert_type {
        CertType::Host => HOST_CERT,
        CertType::User => USER_CERT,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, private::PrivateKey};

    #[test]
    fn authorized_key_drops_comment() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let mut public_key = key.public_key().clone();
        public_key.set_comment("root@db1");

        let encoded = authorized_key(&public_key).unwrap();
        assert!(encoded.starts_with("ssh-ed25519 "));
        assert!(!encoded.contains("root@db1"));
        assert_eq!(encoded.split_whitespace().count(), 2);
    }

    #[test]
    fn cert_type_columns() {
        assert_eq!(cert_type_column(CertType::Host), "host_cert");
        assert_eq!(cert_type_column(CertType::User), "user_cert");
    }
}
