//! TLS material for agent connections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Certificate, Identity};

use crate::error::ConfigError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Optional TLS material for https targets.
///
/// The CA bundle replaces nothing: it is added to the system roots, so a mix
/// of public and private agents works from one client. Client cert and key
/// must be given together.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub ca_bundle: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl TlsSettings {
    /// Build the HTTP client shared by all agent connections.
    pub fn build_client(&self) -> Result<reqwest::Client, ConfigError> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);

        if let Some(path) = &self.ca_bundle {
            let pem = read_pem(path)?;
            let certs =
                Certificate::from_pem_bundle(&pem).map_err(|e| ConfigError::TlsMaterial {
                    path: path.clone(),
                    source: e,
                })?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(cert)?;
                pem.push(b'\n');
                pem.extend_from_slice(&read_pem(key)?);
                let identity =
                    Identity::from_pem(&pem).map_err(|e| ConfigError::TlsMaterial {
                        path: cert.clone(),
                        source: e,
                    })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => return Err(ConfigError::IncompleteKeyPair),
        }

        builder.build().map_err(ConfigError::HttpClient)
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|e| ConfigError::TlsFile {
        path: path.to_path_buf(),
        source: e,
    })
}
