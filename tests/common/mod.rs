#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ssh_hostca::auth_gate::ClientTls;
use ssh_hostca::certificat_authority::CertificateAuthority;
use ssh_hostca::certificat_authority::config::Ca;
use ssh_hostca::certificat_authority::enrollment::IssuanceService;
use ssh_hostca::storage::config::SqliteConfig;
use ssh_hostca::storage::{SqliteStorage, Storage};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, PublicKey, private::PrivateKey};

pub const CERT_DURATION: Duration = Duration::from_secs(7 * 86400);

/// Writes a fresh CA key into `dir` and loads it the way the server does.
pub fn test_ca(dir: &Path) -> Arc<CertificateAuthority> {
    let ca_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let ca_key_path = dir.join("ca_key");
    std::fs::write(
        &ca_key_path,
        ca_key
            .to_openssh(ssh_key::LineEnding::LF)
            .unwrap()
            .as_bytes(),
    )
    .unwrap();

    let mut aliases = HashMap::new();
    aliases.insert(
        "web1.internal.example.com".to_string(),
        vec!["www.example.com".to_string()],
    );
    let config = Ca {
        signing_key: ca_key_path,
        cert_duration: CERT_DURATION,
        strip_suffix: Some(".internal.example.com".to_string()),
        aliases,
    };
    Arc::new(CertificateAuthority::new(&config).unwrap())
}

/// Opens a migrated SQLite database inside `dir`.
pub async fn test_storage(dir: &Path) -> Arc<SqliteStorage> {
    let config = SqliteConfig {
        path: dir.join("hostca.db"),
        max_connections: 8,
        migrations_dir: None,
    };
    let storage = SqliteStorage::connect(&config).await.unwrap();
    storage.migrate(None).await.unwrap();
    Arc::new(storage)
}

pub fn test_service(ca: Arc<CertificateAuthority>, storage: Arc<SqliteStorage>) -> IssuanceService {
    IssuanceService::new(ca, storage)
}

/// Client TLS state as the terminator hands it over for a client
/// certificate naming `names`.
pub fn client_tls(names: &[&str]) -> ClientTls {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names).unwrap();
    ClientTls::with_chain(vec![certified.cert.der().to_vec()])
}

/// A random host key and its authorized-key line.
pub fn host_key() -> (PublicKey, String) {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let public_key = key.public_key().clone();
    let line = format!("{}\n", public_key.to_openssh().unwrap());
    (public_key, line)
}
