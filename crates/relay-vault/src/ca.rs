//! Sources of the Vault server's root CA material.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Result, VaultError};

/// Provides the PEM bundle used to verify the Vault server's TLS
/// certificate. The same bundle rides along in every wrapped secret-id.
#[async_trait::async_trait]
pub trait RootCaSource: Send + Sync {
    async fn root_cas(&self) -> Result<String>;
}

/// Fetches root certificates from the CA endpoints of PKI backends.
///
/// The fetch itself cannot verify the server yet, so it runs without
/// certificate verification; the result is only trusted as far as the
/// network path to the Vault server is.
pub struct VaultCaBackends {
    pub vault_addr: String,
    pub backends: Vec<String>,
}

#[async_trait::async_trait]
impl RootCaSource for VaultCaBackends {
    async fn root_cas(&self) -> Result<String> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;

        let mut bundle = String::new();

        for backend in &self.backends {
            let pem = http
                .get(format!("{}/v1/{}/ca/pem", self.vault_addr, backend))
                .timeout(Duration::from_secs(30))
                .send()
                .await?
                .error_for_status()
                .map_err(|e| VaultError::Certificate(format!(
                    "could not get root certificate for backend {backend}: {e}"
                )))?
                .text()
                .await?;

            bundle.push('\n');
            bundle.push_str(&pem);
        }

        Ok(bundle)
    }
}

/// Reads the root CA bundle from a file on disk.
pub struct CaFile {
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl RootCaSource for CaFile {
    async fn root_cas(&self) -> Result<String> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }
}
