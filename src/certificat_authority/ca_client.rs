//! # CA Client
//!
//! This module provides a client for interacting with the Certificate Authority (CA) server
//! over a Unix socket. It is what the TLS terminator uses to forward enrollments.
use anyhow::{Result, bail};
use log::debug;
use tokio::net::UnixStream;

use super::{CaRequest, CaResponse, read_frame, write_frame};
use crate::auth_gate::ClientTls;

/// A client for the Certificate Authority.
#[derive(Clone)]
pub struct CaClient {
    socket_path: String,
}

impl CaClient {
    /// Creates a new `CaClient`.
    ///
    /// # Arguments
    ///
    /// * `socket_path` - The path to the Unix socket for communication with the CA server.
    pub fn new(socket_path: String) -> Self {
        CaClient { socket_path }
    }

    /// Sends a request to the CA server and returns the response.
    ///
    /// # Arguments
    ///
    /// * `request` - The request to send to the CA server.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `CaResponse` from the server or an error.
    pub async fn send_request(&self, request: &CaRequest) -> Result<CaResponse> {
        debug!("connection to: {}", self.socket_path);
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let request_json = serde_json::to_vec(request)?;
        write_frame(&mut stream, &request_json).await?;
        debug!("wrote to: {}", self.socket_path);

        let response = read_frame(&mut stream).await?;
        let response: CaResponse = serde_json::from_slice(&response)?;
        debug!("read from: {}: {:?}", self.socket_path, response);
        Ok(response)
    }

    /// Fetches all recorded host keys as known-hosts lines.
    ///
    /// The server answers with as many `KnownHosts` frames as the export
    /// needs; they are collected until `EndOfKnownHosts`.
    pub async fn known_hosts(&self) -> Result<Vec<String>> {
        debug!("connection to: {}", self.socket_path);
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let request_json = serde_json::to_vec(&CaRequest::KnownHosts)?;
        write_frame(&mut stream, &request_json).await?;

        let mut lines = Vec::new();
        loop {
            let response = read_frame(&mut stream).await?;
            match serde_json::from_slice::<CaResponse>(&response)? {
                CaResponse::KnownHosts(chunk) => lines.extend(chunk),
                CaResponse::EndOfKnownHosts => break,
                CaResponse::Error { status, message } => {
                    bail!("CA answered {}: {}", status, message)
                }
                other => bail!("unexpected response to known hosts request: {:?}", other),
            }
        }
        debug!("read {} known hosts from: {}", lines.len(), self.socket_path);
        Ok(lines)
    }

    /// Forwards an enrollment for `host_name`.
    pub async fn enroll(&self, host_name: &str, tls: ClientTls, body: &str) -> Result<CaResponse> {
        self.send_request(&CaRequest::Enroll {
            host_name: host_name.to_string(),
            tls,
            body: body.to_string(),
        })
        .await
    }
}
