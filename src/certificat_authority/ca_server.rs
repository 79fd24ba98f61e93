//! # CA Server
//!
//! This module provides a server for the Certificate Authority (CA) that listens for requests
//! on a Unix socket. The TLS terminator forwards enrollments here together with the client
//! certificate chains it verified, and relays the answer to the HTTP client.
//!
//! Messages are JSON, framed with a 4-byte big-endian length prefix. Every connection is
//! served on its own task; issuance takes no lock beyond the storage upsert.
use std::fs;
use std::mem;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::Result;
use futures::TryStreamExt;
use log::{debug, error, info};
use tokio::io::AsyncWrite;
use tokio::net::{UnixListener, UnixStream};

use super::enrollment::IssuanceService;
use super::{
    CaRequest, CaResponse, KNOWN_HOSTS_CHUNK_SIZE, MAX_MESSAGE_SIZE, read_frame, write_frame,
};
use crate::auth_gate::ClientTls;

/// A server for the Certificate Authority.
pub struct CaServer {
    socket_path: String,
    service: IssuanceService,
    /// UIDs of the processes allowed to talk to the CA.
    allowed_uids: Vec<u32>,
}

impl CaServer {
    /// Creates a new `CaServer`.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - The path to the Unix socket to listen on.
    /// * `service` - The issuance service handling enrollments.
    /// * `allowed_uids` - UIDs of peers allowed to connect.
    pub fn new(socket_path: String, service: IssuanceService, allowed_uids: Vec<u32>) -> Self {
        CaServer {
            socket_path,
            service,
            allowed_uids,
        }
    }

    /// Runs the CA server.
    ///
    /// This function binds to the specified Unix socket and enters a loop to accept
    /// incoming connections, each handled on a separate task.
    pub async fn run(self) -> Result<()> {
        // Clean up old socket if it exists
        if fs::metadata(&self.socket_path).is_ok() {
            fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        // Owner and group only; the TLS terminator is expected to share the group.
        fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o660))?;
        info!("CA server listening on {}", self.socket_path);

        let server = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("New connection to CA server");
                    match stream.peer_cred() {
                        Ok(cred) => {
                            if !server.allowed_uids.contains(&cred.uid()) {
                                error!(
                                    "Rejected CA connection from UID {}, allowed {:?}",
                                    cred.uid(),
                                    server.allowed_uids
                                );
                                continue;
                            }
                        }
                        Err(e) => {
                            error!("Failed to get peer credentials: {}", e);
                            continue;
                        }
                    }
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_connection(stream).await {
                            error!("CA connection failed: {}", e);
                        }
                    });
                }
                Err(e) => error!("connection failed: {:?}", e),
            }
        }
    }

    async fn serve_connection(&self, mut stream: UnixStream) -> Result<()> {
        let request = read_frame(&mut stream).await?;
        debug!("got request (length={})", request.len());
        match serde_json::from_slice::<CaRequest>(&request) {
            Ok(CaRequest::Enroll {
                host_name,
                tls,
                body,
            }) => {
                let response = self.handle_enroll(&host_name, &tls, &body).await;
                send_response(&mut stream, &response).await
            }
            Ok(CaRequest::KnownHosts) => self.send_known_hosts(&mut stream).await,
            Err(e) => {
                error!("Failed to deserialize request: {}", e);
                let response = CaResponse::Error {
                    status: 400,
                    message: "invalid request format".to_string(),
                };
                send_response(&mut stream, &response).await
            }
        }
    }

    /// Runs an enrollment and turns its outcome into a [`CaResponse`].
    pub async fn handle_enroll(&self, host_name: &str, tls: &ClientTls, body: &str) -> CaResponse {
        debug!("enrolling {}", host_name);
        match self.service.enroll(host_name, tls, body.as_bytes()).await {
            Ok(cert) => CaResponse::Certificate(cert),
            Err(e) => CaResponse::Error {
                status: e.status_code(),
                message: e.public_message(),
            },
        }
    }

    /// Writes the known-hosts export as `KnownHosts` frames of at most
    /// [`KNOWN_HOSTS_CHUNK_SIZE`] line bytes, then `EndOfKnownHosts`.
    /// A storage failure ends the export with an `Error` frame instead.
    async fn send_known_hosts<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        debug!("exporting known hosts");
        let mut lines = self.service.known_hosts_lines();
        let mut chunk = Vec::new();
        let mut chunk_size = 0;
        let mut total = 0;
        loop {
            match lines.try_next().await {
                Ok(Some(line)) => {
                    if !chunk.is_empty() && chunk_size + line.len() > KNOWN_HOSTS_CHUNK_SIZE {
                        send_response(stream, &CaResponse::KnownHosts(mem::take(&mut chunk)))
                            .await?;
                        chunk_size = 0;
                    }
                    chunk_size += line.len();
                    total += 1;
                    chunk.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    error!("failed to export host keys: {}", e);
                    return send_response(stream, &internal_error()).await;
                }
            }
        }
        if !chunk.is_empty() {
            send_response(stream, &CaResponse::KnownHosts(chunk)).await?;
        }
        debug!("exported {} known hosts", total);
        send_response(stream, &CaResponse::EndOfKnownHosts).await
    }
}

fn internal_error() -> CaResponse {
    CaResponse::Error {
        status: 500,
        message: "internal error".to_string(),
    }
}

/// Serializes and writes one response. A response too large for a frame is
/// replaced by an internal error, so the peer always gets a status.
async fn send_response<S: AsyncWrite + Unpin>(stream: &mut S, response: &CaResponse) -> Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        error!(
            "response of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_MESSAGE_SIZE
        );
        payload = serde_json::to_vec(&internal_error())?;
    }
    write_frame(stream, &payload).await
}
