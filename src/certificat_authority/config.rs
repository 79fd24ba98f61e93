//! # CA Configuration
//!
//! This module defines the configuration structures for the Certificate Authority (CA)
//! and the socket it serves enrollment requests on.
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Deserializer};

use crate::config::{InsertConfigRoot, resolve_path};

/// Configuration for the Certificate Authority.
#[derive(Deserialize, Debug, Clone)]
pub struct Ca {
    /// The path to the CA's private key in OpenSSH format.
    pub signing_key: PathBuf,
    /// How long issued certificates are valid, e.g. `"168h"`.
    #[serde(deserialize_with = "deserialize_duration")]
    pub cert_duration: Duration,
    /// When a hostname ends with this suffix, the stripped name is added as
    /// an extra principal.
    #[serde(default)]
    pub strip_suffix: Option<String>,
    /// Extra principals per hostname.
    #[serde(default)]
    pub aliases: HashMap<String, Vec<String>>,
}

/// Configuration for the enrollment socket.
#[derive(Deserialize, Debug, Clone)]
pub struct Server {
    /// The path of the Unix socket the TLS terminator connects to.
    pub socket_path: String,
    /// UIDs allowed to connect. Defaults to the UID of the CA process.
    #[serde(default)]
    pub allowed_uids: Option<Vec<u32>>,
    /// Run pending migrations before serving.
    #[serde(default)]
    pub auto_migrate: bool,
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let duration = duration_str::parse(&raw).map_err(serde::de::Error::custom)?;
    if duration.is_zero() {
        return Err(serde::de::Error::custom("cert_duration must not be zero"));
    }
    Ok(duration)
}

impl InsertConfigRoot for Ca {
    /// Resolves the signing key path relative to the configuration file.
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()> {
        resolve_path(config_root, &mut self.signing_key);
        Ok(())
    }

    /// Checks that the signing key exists.
    fn check_paths(&self) -> Result<()> {
        if self.signing_key.exists() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("CA key file {:?} not found", self.signing_key),
            )
            .into())
        }
    }
}

impl InsertConfigRoot for Server {
    /// Resolves the socket path relative to the configuration file.
    fn insert_config_path(&mut self, config_root: &PathBuf) -> Result<()> {
        let mut socket_path = PathBuf::from(&self.socket_path);
        resolve_path(config_root, &mut socket_path);
        self.socket_path = socket_path
            .to_str()
            .ok_or_else(|| anyhow!("socket path {:?} is not valid UTF-8", socket_path))?
            .to_string();
        Ok(())
    }

    /// Checks that the directory the socket is created in exists.
    fn check_paths(&self) -> Result<()> {
        match Path::new(&self.socket_path).parent() {
            Some(dir) if dir.as_os_str().is_empty() || dir.is_dir() => Ok(()),
            Some(dir) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("socket directory {:?} not found", dir),
            )
            .into()),
            None => bail!("invalid socket path {:?}", self.socket_path),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_duration_strings() {
        let ca: Ca = toml::from_str(
            r#"
signing_key = "ca_key"
cert_duration = "168h"
"#,
        )
        .unwrap();
        assert_eq!(ca.cert_duration, Duration::from_secs(168 * 3600));
        assert!(ca.strip_suffix.is_none());
        assert!(ca.aliases.is_empty());
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(
            toml::from_str::<Ca>(
                r#"
signing_key = "ca_key"
cert_duration = "a week"
"#
            )
            .is_err()
        );
        assert!(
            toml::from_str::<Ca>(
                r#"
signing_key = "ca_key"
cert_duration = "0s"
"#
            )
            .is_err()
        );
    }

    #[test]
    fn resolves_relative_key_path() {
        let mut ca: Ca = toml::from_str(
            r#"
signing_key = "keys/ca_key"
cert_duration = "1h"
"#,
        )
        .unwrap();
        ca.insert_config_path(&PathBuf::from("/etc/hostca")).unwrap();
        assert_eq!(ca.signing_key, PathBuf::from("/etc/hostca/keys/ca_key"));
        assert!(ca.check_paths().is_err());
    }

    #[test]
    fn resolves_relative_socket_path() {
        let mut server: Server = toml::from_str(
            r#"
socket_path = "run/hostca.sock"
"#,
        )
        .unwrap();
        server
            .insert_config_path(&PathBuf::from("/etc/hostca"))
            .unwrap();
        assert_eq!(server.socket_path, "/etc/hostca/run/hostca.sock");
        assert!(server.check_paths().is_err());

        let mut server: Server = toml::from_str(
            r#"
socket_path = "/run/hostca.sock"
"#,
        )
        .unwrap();
        server
            .insert_config_path(&PathBuf::from("/etc/hostca"))
            .unwrap();
        assert_eq!(server.socket_path, "/run/hostca.sock");
    }
}
