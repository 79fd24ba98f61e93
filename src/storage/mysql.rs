//! # MySQL Storage
//!
//! `Storage` backed by a MySQL (InnoDB) server.
//!
//! An issuance first upserts the `hostkeys` row, which takes its row lock.
//! The serial is allocated from the `issuance_log` auto-increment only while
//! that lock is held, then written back to the row. Concurrent enrollments
//! of the same principal are therefore serialized by the server, and the
//! serial order matches the commit order: the last commit wins and carries
//! the highest serial.
//!
//! Racing inserts of a new principal can deadlock in InnoDB; the losing
//! transaction is rolled back by the server and retried here.
use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use sqlx::migrate::Migrator;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::{MySql, QueryBuilder};
use ssh_key::PublicKey;
use ssh_key::certificate::CertType;

use super::config::MysqlConfig;
use super::{
    HOST_CERT, HostKey, MAPPING_CHUNK_SIZE, Storage, StorageError, authorized_key,
    cert_type_column,
};

const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Attempts at an issuance before a deadlock is reported.
const DEADLOCK_ATTEMPTS: usize = 5;

/// SQLSTATE for "serialization failure", which MySQL raises on deadlock.
const SQLSTATE_DEADLOCK: &str = "40001";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/mysql");

/// MySQL implementation of [`Storage`].
#[derive(Clone)]
pub struct MysqlStorage {
    pool: MySqlPool,
}

impl MysqlStorage {
    /// Connects to the server described by the configuration.
    pub async fn connect(config: &MysqlConfig) -> Result<Self, StorageError> {
        let options = connect_options(config)?;
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(MysqlStorage { pool })
    }
}

fn connect_options(config: &MysqlConfig) -> Result<MySqlConnectOptions, StorageError> {
    let (host, port) = split_address(&config.address)?;
    let mut options = MySqlConnectOptions::new()
        .host(host)
        .port(port)
        .username(&config.username)
        .database(&config.schema);
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    match &config.tls {
        Some(tls) => {
            options = options
                .ssl_mode(MySqlSslMode::VerifyIdentity)
                .ssl_ca(&tls.ca_cert);
            if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
                options = options.ssl_client_cert(cert).ssl_client_key(key);
            }
        }
        None => options = options.ssl_mode(MySqlSslMode::Disabled),
    }
    Ok(options)
}

/// Splits `host[:port]` into its parts.
fn split_address(address: &str) -> Result<(&str, u16), StorageError> {
    match address.rsplit_once(':') {
        None => Ok((address, DEFAULT_MYSQL_PORT)),
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| StorageError::Config(format!("bad port in {}: {}", address, e)))?;
            if host.is_empty() {
                return Err(StorageError::Config(format!("missing host in {}", address)));
            }
            Ok((host, port))
        }
    }
}

impl MysqlStorage {
    async fn try_record_issuance(
        &self,
        cert_type: &str,
        principal: &str,
        pubkey: &str,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO hostkeys (hostname, cert_type, pubkey, serial) VALUES (?, ?, ?, 0) \
             ON DUPLICATE KEY UPDATE pubkey = VALUES(pubkey)",
        )
        .bind(principal)
        .bind(cert_type)
        .bind(pubkey)
        .execute(&mut *tx)
        .await?;

        // LAST_INSERT_ID is only reliable for a plain insert, so the serial is
        // allocated here and written into hostkeys explicitly.
        let serial = sqlx::query(
            "INSERT INTO issuance_log (principal, cert_type, pubkey) VALUES (?, ?, ?)",
        )
        .bind(principal)
        .bind(cert_type)
        .bind(pubkey)
        .execute(&mut *tx)
        .await?
        .last_insert_id();

        sqlx::query("UPDATE hostkeys SET serial = ? WHERE hostname = ? AND cert_type = ?")
            .bind(serial)
            .bind(principal)
            .bind(cert_type)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(serial)
    }
}

fn is_deadlock(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(SQLSTATE_DEADLOCK),
        _ => false,
    }
}

#[async_trait]
impl Storage for MysqlStorage {
    async fn record_issuance(
        &self,
        cert_type: CertType,
        principal: &str,
        public_key: &PublicKey,
    ) -> Result<u64, StorageError> {
        let pubkey = authorized_key(public_key)?;
        let cert_type = cert_type_column(cert_type);

        let mut attempt = 1;
        loop {
            match self.try_record_issuance(cert_type, principal, &pubkey).await {
                Ok(serial) => {
                    debug!("recorded {} {} with serial {}", cert_type, principal, serial);
                    return Ok(serial);
                }
                Err(e) if attempt < DEADLOCK_ATTEMPTS && is_deadlock(&e) => {
                    warn!(
                        "deadlock recording {} {} (attempt {}), retrying",
                        cert_type, principal, attempt
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn query_host_keys(&self) -> BoxStream<'_, Result<HostKey, StorageError>> {
        sqlx::query_as::<_, HostKey>(
            "SELECT hostname, pubkey FROM hostkeys WHERE cert_type = ? ORDER BY hostname",
        )
        .bind(HOST_CERT)
        .fetch(&self.pool)
        .map_err(StorageError::from)
        .boxed()
    }

    async fn record_identity_mapping(
        &self,
        mapping: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let entries: Vec<(&String, &String)> = mapping.iter().collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM identity_mappings")
            .execute(&mut *tx)
            .await?;
        for chunk in entries.chunks(MAPPING_CHUNK_SIZE) {
            let mut builder =
                QueryBuilder::<MySql>::new("INSERT INTO identity_mappings (identity, username) ");
            builder.push_values(chunk.iter().copied(), |mut row, (identity, username)| {
                row.push_bind(identity.as_str()).push_bind(username.as_str());
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!("replaced identity mappings with {} entries", entries.len());
        Ok(())
    }

    async fn query_identity_mapping(&self, identity: &str) -> Result<String, StorageError> {
        sqlx::query_scalar::<_, String>("SELECT username FROM identity_mappings WHERE identity = ?")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(identity.to_string()))
    }

    async fn migrate(&self, migrations_dir: Option<&Path>) -> Result<(), StorageError> {
        match migrations_dir {
            Some(dir) => {
                info!("running mysql migrations from {:?}", dir);
                Migrator::new(dir).await?.run(&self.pool).await?;
            }
            None => {
                info!("running embedded mysql migrations");
                MIGRATOR.run(&self.pool).await?;
            }
        }
        Ok(())
    }
}
