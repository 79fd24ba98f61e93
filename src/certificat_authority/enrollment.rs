//! # Enrollment
//!
//! Orchestrates a host enrollment: authorize the caller, parse the submitted
//! key, record the issuance, sign, and encode the certificate for transport.
//! Nothing is written to storage before the caller has been authorized and
//! the key has parsed.
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use log::{error, info, warn};
use ssh_key::authorized_keys::Entry;
use ssh_key::certificate::{CertType, Certificate};
use ssh_key::{HashAlg, PublicKey};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{CertificateAuthority, SigningError};
use crate::auth_gate::{self, ClientTls};
use crate::storage::{Storage, StorageError};

/// Upper bound for the submitted public key.
pub const MAX_PUBLIC_KEY_SIZE: u64 = 16 * 1024;

const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// Errors returned by an enrollment.
#[derive(Debug, Error)]
pub enum EnrollError {
    /// The caller did not present a verified client certificate.
    #[error("no client certificate provided")]
    NotAuthenticated,
    /// The client certificate does not cover the requested hostname.
    #[error("hostname {0} does not match certificate")]
    Forbidden(String),
    /// The request body is not a usable public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    /// The request body could not be read.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl EnrollError {
    /// The HTTP status the router answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            EnrollError::NotAuthenticated => 401,
            EnrollError::Forbidden(_) => 403,
            EnrollError::InvalidPublicKey(_) | EnrollError::InvalidRequest(_) => 400,
            EnrollError::Storage(_) | EnrollError::Signing(_) => 500,
        }
    }

    /// The message shown to the caller. Internal failures never expose
    /// their detail; it only goes to the server log.
    pub fn public_message(&self) -> String {
        match self {
            EnrollError::Storage(_) | EnrollError::Signing(_) => {
                INTERNAL_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Issues host certificates to authenticated hosts.
#[derive(Clone)]
pub struct IssuanceService {
    ca: Arc<CertificateAuthority>,
    storage: Arc<dyn Storage>,
}

impl IssuanceService {
    /// Creates a new `IssuanceService`.
    ///
    /// # Arguments
    ///
    /// * `ca` - The CA holding the signing key.
    /// * `storage` - The storage backend selected at startup.
    pub fn new(ca: Arc<CertificateAuthority>, storage: Arc<dyn Storage>) -> Self {
        IssuanceService { ca, storage }
    }

    /// Enrolls `host_name` and returns the certificate as
    /// `<type>-cert-v01@openssh.com <base64>`, without a trailing newline.
    ///
    /// `body` is only read once the caller is authorized for `host_name`.
    pub async fn enroll<R>(
        &self,
        host_name: &str,
        tls: &ClientTls,
        body: R,
    ) -> Result<String, EnrollError>
    where
        R: AsyncRead + Unpin,
    {
        if !auth_gate::is_authenticated(tls) {
            warn!("enrollment for {} without client certificate", host_name);
            return Err(EnrollError::NotAuthenticated);
        }
        if !auth_gate::matches_hostname(host_name, tls) {
            warn!(
                "client certificate does not match requested hostname {}",
                host_name
            );
            return Err(EnrollError::Forbidden(host_name.to_string()));
        }

        let public_key = read_public_key(body).await?;

        let serial = self
            .storage
            .record_issuance(CertType::Host, host_name, &public_key)
            .await
            .map_err(|e| {
                error!("failed to record issuance for {}: {}", host_name, e);
                e
            })?;

        let cert = self
            .ca
            .sign_host_certificate(host_name, serial, &public_key)
            .map_err(|e| {
                error!("failed to sign certificate for {}: {}", host_name, e);
                e
            })?;
        let encoded = encode_certificate(&cert).map_err(|e| {
            error!("failed to encode certificate for {}: {}", host_name, e);
            e
        })?;

        info!(
            "issued host certificate for {} (serial {}, key {}, valid for {})",
            host_name,
            serial,
            public_key.fingerprint(HashAlg::Sha256),
            humantime::format_duration(self.ca.cert_duration())
        );
        Ok(encoded)
    }

    /// Streams every recorded host key as a `<hostname> <key>` line.
    pub fn known_hosts_lines(&self) -> BoxStream<'_, Result<String, StorageError>> {
        self.storage
            .query_host_keys()
            .map_ok(|host_key| format!("{} {}", host_key.hostname, host_key.public_key))
            .boxed()
    }

    /// Returns every recorded host key as a `<hostname> <key>` line.
    pub async fn known_hosts(&self) -> Result<Vec<String>, StorageError> {
        self.known_hosts_lines().try_collect().await
    }
}

async fn read_public_key<R: AsyncRead + Unpin>(body: R) -> Result<PublicKey, EnrollError> {
    let mut data = Vec::new();
    body.take(MAX_PUBLIC_KEY_SIZE + 1)
        .read_to_end(&mut data)
        .await
        .map_err(|e| EnrollError::InvalidRequest(e.to_string()))?;
    if data.len() as u64 > MAX_PUBLIC_KEY_SIZE {
        return Err(EnrollError::InvalidRequest(format!(
            "request body exceeds {} bytes",
            MAX_PUBLIC_KEY_SIZE
        )));
    }
    let text = std::str::from_utf8(&data)
        .map_err(|_| EnrollError::InvalidPublicKey("not valid UTF-8".to_string()))?;
    parse_authorized_key(text)
}

/// Parses the first key line of `text`, in authorized-keys syntax.
pub fn parse_authorized_key(text: &str) -> Result<PublicKey, EnrollError> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| EnrollError::InvalidPublicKey("no public key submitted".to_string()))?;
    let entry = Entry::from_str(line).map_err(|e| EnrollError::InvalidPublicKey(e.to_string()))?;
    Ok(entry.public_key().clone())
}

/// Encodes a certificate the way OpenSSH writes `*-cert.pub` files, minus
/// the comment.
pub fn encode_certificate(cert: &Certificate) -> Result<String, SigningError> {
    let bytes = cert.to_bytes().map_err(SigningError::Encoding)?;
    Ok(format!(
        "{} {}",
        cert.algorithm().to_certificate_type(),
        STANDARD.encode(bytes)
    ))
}
