//! # SQLite Storage
//!
//! `Storage` backed by a single SQLite database file. Writers are serialized
//! by SQLite's database lock; the busy timeout makes concurrent enrollments
//! queue up instead of failing.
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use log::{debug, info};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use ssh_key::PublicKey;
use ssh_key::certificate::CertType;

use super::config::SqliteConfig;
use super::{
    HOST_CERT, HostKey, MAPPING_CHUNK_SIZE, Storage, StorageError, authorized_key,
    cert_type_column,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite implementation of [`Storage`].
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens (and creates if needed) the database file from the configuration.
    pub async fn connect(config: &SqliteConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(SqliteStorage { pool })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn record_issuance(
        &self,
        cert_type: CertType,
        principal: &str,
        public_key: &PublicKey,
    ) -> Result<u64, StorageError> {
        let pubkey = authorized_key(public_key)?;
        let cert_type = cert_type_column(cert_type);

        // The first statement is a write, so the transaction holds the write
        // lock from the start and the serial order matches the commit order.
        let mut tx = self.pool.begin().await?;
        let serial = sqlx::query(
            "INSERT INTO issuance_log (principal, cert_type, pubkey) VALUES (?, ?, ?)",
        )
        .bind(principal)
        .bind(cert_type)
        .bind(&pubkey)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query(
            "INSERT INTO hostkeys (hostname, cert_type, pubkey, serial) VALUES (?, ?, ?, ?) \
             ON CONFLICT (hostname, cert_type) \
             DO UPDATE SET pubkey = excluded.pubkey, serial = excluded.serial",
        )
        .bind(principal)
        .bind(cert_type)
        .bind(&pubkey)
        .bind(serial)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("recorded {} {} with serial {}", cert_type, principal, serial);
        Ok(serial as u64)
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
                QueryBuilder::<Sqlite>::new("INSERT INTO identity_mappings (identity, username) ");
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
                info!("running sqlite migrations from {:?}", dir);
                Migrator::new(dir).await?.run(&self.pool).await?;
            }
            None => {
                info!("running embedded sqlite migrations");
                MIGRATOR.run(&self.pool).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, private::PrivateKey};
    use tempfile::TempDir;

    async fn open_storage(temp_dir: &TempDir) -> SqliteStorage {
        let config = SqliteConfig {
            path: temp_dir.path().join("hostca.db"),
            max_connections: 4,
            migrations_dir: None,
        };
        let storage = SqliteStorage::connect(&config).await.unwrap();
        storage.migrate(None).await.unwrap();
        storage
    }

    fn random_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    async fn host_keys(storage: &SqliteStorage) -> Vec<HostKey> {
        storage.query_host_keys().try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn record_issuance_is_idempotent_per_principal() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;
        let key = random_key();

        let first = storage
            .record_issuance(CertType::Host, "db1.example.com", &key)
            .await
            .unwrap();
        let second = storage
            .record_issuance(CertType::Host, "db1.example.com", &key)
            .await
            .unwrap();
        assert!(second > first);

        let rows = host_keys(&storage).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hostname, "db1.example.com");
        assert_eq!(rows[0].public_key, authorized_key(&key).unwrap());
    }

    #[tokio::test]
    async fn record_issuance_replaces_key() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;
        let old_key = random_key();
        let new_key = random_key();

        storage
            .record_issuance(CertType::Host, "web1", &old_key)
            .await
            .unwrap();
        let serial = storage
            .record_issuance(CertType::Host, "web1", &new_key)
            .await
            .unwrap();

        let rows = host_keys(&storage).await;
        assert_eq!(
            rows,
            vec![HostKey {
                hostname: "web1".to_string(),
                public_key: authorized_key(&new_key).unwrap(),
            }]
        );

        let stored_serial: i64 = sqlx::query_scalar("SELECT serial FROM hostkeys WHERE hostname = ?")
            .bind("web1")
            .fetch_one(&storage.pool)
            .await
            .unwrap();
        assert_eq!(stored_serial as u64, serial);
    }

    #[tokio::test]
    async fn concurrent_issuance_keeps_highest_serial() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let storage = storage.clone();
            tasks.push(tokio::spawn(async move {
                let key = random_key();
                let serial = storage
                    .record_issuance(CertType::Host, "db1.example.com", &key)
                    .await
                    .unwrap();
                (serial, key)
            }));
        }
        let mut issued = Vec::new();
        for task in tasks {
            issued.push(task.await.unwrap());
        }

        let (last_serial, last_key) = issued.iter().max_by_key(|(serial, _)| *serial).unwrap();
        let stored_serial: i64 = sqlx::query_scalar("SELECT serial FROM hostkeys WHERE hostname = ?")
            .bind("db1.example.com")
            .fetch_one(&storage.pool)
            .await
            .unwrap();
        assert_eq!(stored_serial as u64, *last_serial);
        let rows = host_keys(&storage).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].public_key, authorized_key(last_key).unwrap());
    }

    #[tokio::test]
    async fn user_keys_are_not_exported_as_host_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        storage
            .record_issuance(CertType::User, "alice", &random_key())
            .await
            .unwrap();
        storage
            .record_issuance(CertType::Host, "alice", &random_key())
            .await
            .unwrap();

        let rows = host_keys(&storage).await;
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn host_key_query_is_restartable() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;
        storage
            .record_issuance(CertType::Host, "a.example.com", &random_key())
            .await
            .unwrap();
        assert_eq!(host_keys(&storage).await.len(), 1);

        storage
            .record_issuance(CertType::Host, "b.example.com", &random_key())
            .await
            .unwrap();
        let hostnames: Vec<String> = host_keys(&storage)
            .await
            .into_iter()
            .map(|row| row.hostname)
            .collect();
        assert_eq!(hostnames, vec!["a.example.com", "b.example.com"]);
    }

    #[tokio::test]
    async fn identity_mapping_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        let mut mapping = HashMap::new();
        mapping.insert("alice@example.com".to_string(), "alice-gh".to_string());
        mapping.insert("bob@example.com".to_string(), "bob-gh".to_string());
        storage.record_identity_mapping(&mapping).await.unwrap();
        assert_eq!(
            storage
                .query_identity_mapping("bob@example.com")
                .await
                .unwrap(),
            "bob-gh"
        );

        let mut mapping = HashMap::new();
        mapping.insert("alice@example.com".to_string(), "alice-renamed".to_string());
        storage.record_identity_mapping(&mapping).await.unwrap();

        assert_eq!(
            storage
                .query_identity_mapping("alice@example.com")
                .await
                .unwrap(),
            "alice-renamed"
        );
        assert!(matches!(
            storage.query_identity_mapping("bob@example.com").await,
            Err(StorageError::NotFound(identity)) if identity == "bob@example.com"
        ));
    }

    #[tokio::test]
    async fn empty_identity_mapping_clears_table() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        let mut mapping = HashMap::new();
        mapping.insert("alice@example.com".to_string(), "alice-gh".to_string());
        storage.record_identity_mapping(&mapping).await.unwrap();

        storage.record_identity_mapping(&HashMap::new()).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identity_mappings")
            .fetch_one(&storage.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn large_identity_mapping_is_chunked() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;

        let mapping: HashMap<String, String> = (0..1200)
            .map(|i| (format!("user{}@example.com", i), format!("user{}", i)))
            .collect();
        storage.record_identity_mapping(&mapping).await.unwrap();

        assert_eq!(
            storage
                .query_identity_mapping("user1199@example.com")
                .await
                .unwrap(),
            "user1199"
        );
    }

    #[tokio::test]
    async fn migrate_twice_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let storage = open_storage(&temp_dir).await;
        storage.migrate(None).await.unwrap();

        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations/sqlite");
        storage.migrate(Some(&migrations_dir)).await.unwrap();
    }
}
