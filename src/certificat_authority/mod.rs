//! # Certificate Authority
//!
//! This module provides the core functionality for the Certificate Authority (CA).
//! It turns an enrollment (hostname, serial, public key) into a signed OpenSSH
//! host certificate, and defines the messages exchanged with the TLS terminator
//! over the CA socket.
use std::fs::File;
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use ssh_key::rand_core::{CryptoRng, OsRng, RngCore};
use ssh_key::{
    PublicKey,
    certificate::{Builder as CertBuilder, CertType, Certificate},
    private::PrivateKey,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::auth_gate::ClientTls;

/// Maximum size (in bytes) for a single IPC message on the Unix socket.
/// Both client and server enforce this limit. Enrollment requests carry the
/// client's DER certificate chain, so this is larger than a key alone needs.
pub const MAX_MESSAGE_SIZE: u32 = 262_144;

/// Upper bound for the line bytes carried by one `KnownHosts` frame. Half of
/// `MAX_MESSAGE_SIZE` leaves room for the JSON quoting around each line.
pub const KNOWN_HOSTS_CHUNK_SIZE: usize = (MAX_MESSAGE_SIZE / 2) as usize;

/// Size of the random nonce placed in every certificate.
pub const NONCE_SIZE: usize = 32;

/// Client for communicating with the CA server over a Unix socket.
pub mod ca_client;
/// CA server that listens for enrollment requests on a Unix socket.
pub mod ca_server;
/// Configuration types for the Certificate Authority.
pub mod config;
/// Orchestration of an enrollment request.
pub mod enrollment;

/// Errors that can occur while producing a certificate.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The operating system could not supply random bytes for the nonce.
    #[error("failed to obtain nonce entropy: {0}")]
    Entropy(String),
    /// The system clock is unusable for a validity window.
    #[error("system clock error: {0}")]
    Clock(String),
    /// The certificate template was rejected.
    #[error("invalid certificate template: {0}")]
    Template(ssh_key::Error),
    /// The signing operation failed.
    #[error("signing failed: {0}")]
    Signature(ssh_key::Error),
    /// The signed certificate could not be serialized.
    #[error("failed to encode certificate: {0}")]
    Encoding(ssh_key::Error),
}

/// Represents the Certificate Authority.
pub struct CertificateAuthority {
    private_key: PrivateKey,
    config: config::Ca,
}

impl CertificateAuthority {
    /// Creates a new `CertificateAuthority` instance.
    ///
    /// # Arguments
    ///
    /// * `ca_config` - The configuration for the CA.
    ///
    /// # Returns
    ///
    /// A `Result` containing the new `CertificateAuthority` instance or an error.
    pub fn new(ca_config: &config::Ca) -> Result<Self> {
        let mut key_file = File::open(&ca_config.signing_key)?;
        let mut key_buffer = Zeroizing::new(Vec::new());
        key_file.read_to_end(&mut key_buffer)?;

        let private_key = PrivateKey::from_openssh(&*key_buffer)?;
        if private_key.is_encrypted() {
            bail!(
                "CA key {:?} is encrypted, an unencrypted key is required",
                ca_config.signing_key
            );
        }
        Ok(CertificateAuthority::from_key(
            private_key,
            ca_config.clone(),
        ))
    }

    /// Creates a `CertificateAuthority` from an already loaded key.
    pub fn from_key(private_key: PrivateKey, config: config::Ca) -> Self {
        CertificateAuthority {
            private_key,
            config,
        }
    }

    /// The public half of the signing key.
    pub fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }

    /// The validity of issued certificates.
    pub fn cert_duration(&self) -> Duration {
        self.config.cert_duration
    }

    /// Builds the principal list for `host_name`: the name itself, the name
    /// with the configured suffix stripped, then the configured aliases.
    pub fn principals_for(&self, host_name: &str) -> Vec<String> {
        let mut principals = vec![host_name.to_string()];
        if let Some(suffix) = self.config.strip_suffix.as_deref() {
            if let Some(stripped) = host_name.strip_suffix(suffix) {
                if !suffix.is_empty() && !stripped.is_empty() {
                    principals.push(stripped.to_string());
                }
            }
        }
        if let Some(aliases) = self.config.aliases.get(host_name) {
            principals.extend(aliases.iter().cloned());
        }
        principals
    }

    /// Signs `public_key` as a host certificate for `host_name`.
    ///
    /// # Arguments
    ///
    /// * `host_name` - The canonical hostname, used as key id and first principal.
    /// * `serial` - The serial allocated by storage for this issuance.
    /// * `public_key` - The public key to be signed.
    ///
    /// # Returns
    ///
    /// A `Result` containing the signed `Certificate` or an error.
    pub fn sign_host_certificate(
        &self,
        host_name: &str,
        serial: u64,
        public_key: &PublicKey,
    ) -> Result<Certificate, SigningError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SigningError::Clock(e.to_string()))?
            .as_secs();
        self.sign_host_certificate_with(&mut OsRng, now, host_name, serial, public_key)
    }

    fn sign_host_certificate_with<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        valid_after: u64,
        host_name: &str,
        serial: u64,
        public_key: &PublicKey,
    ) -> Result<Certificate, SigningError> {
        // A short read must abort the issuance, never fall back to a weak nonce.
        let mut nonce = [0u8; NONCE_SIZE];
        rng.try_fill_bytes(&mut nonce)
            .map_err(|e| SigningError::Entropy(e.to_string()))?;

        let valid_before = valid_after
            .checked_add(self.config.cert_duration.as_secs())
            .ok_or_else(|| SigningError::Clock("validity window overflows".to_string()))?;

        let mut cert_builder =
            CertBuilder::new(nonce.to_vec(), public_key, valid_after, valid_before)
                .map_err(SigningError::Template)?;
        cert_builder
            .serial(serial)
            .map_err(SigningError::Template)?;
        cert_builder
            .cert_type(CertType::Host)
            .map_err(SigningError::Template)?;
        cert_builder
            .key_id(host_name)
            .map_err(SigningError::Template)?;
        for principal in self.principals_for(host_name) {
            debug!("adding principal: {}", principal);
            cert_builder
                .valid_principal(principal)
                .map_err(SigningError::Template)?;
        }

        match cert_builder.sign(&self.private_key) {
            Ok(cert) => Ok(cert),
            Err(e) => {
                error!("signing failed: {}", e);
                Err(SigningError::Signature(e))
            }
        }
    }
}

/// Represents a request to the Certificate Authority.
#[derive(Serialize, Deserialize, Debug)]
pub enum CaRequest {
    /// An enrollment forwarded by the TLS terminator.
    Enroll {
        /// The hostname from the request path.
        host_name: String,
        /// The verified client certificate chains.
        tls: ClientTls,
        /// The raw request body: the host's public key in authorized-key form.
        body: String,
    },
    /// A request for all recorded host keys in known-hosts form. The answer
    /// is a series of `KnownHosts` frames closed by `EndOfKnownHosts`, or an
    /// `Error` frame.
    KnownHosts,
}

/// Represents a response from the Certificate Authority.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum CaResponse {
    /// The signed certificate, `<type>-cert-v01@openssh.com <base64>`.
    Certificate(String),
    /// A chunk of known-hosts lines, one per recorded host key.
    KnownHosts(Vec<String>),
    /// Ends a known-hosts export.
    EndOfKnownHosts,
    /// The request failed; `status` is the HTTP status to answer with.
    Error { status: u16, message: String },
}

/// Reads one length-prefixed (4-byte big-endian) message.
pub(crate) async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let msg_len = u32::from_be_bytes(len_buf);
    if msg_len > MAX_MESSAGE_SIZE {
        bail!(
            "message size {} exceeds maximum {}",
            msg_len,
            MAX_MESSAGE_SIZE
        );
    }
    let mut buf = vec![0u8; msg_len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one length-prefixed (4-byte big-endian) message.
pub(crate) async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())?;
    if len > MAX_MESSAGE_SIZE {
        bail!("message size {} exceeds maximum {}", len, MAX_MESSAGE_SIZE);
    }
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}
