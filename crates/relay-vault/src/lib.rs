//! Vault client for the controller.
//!
//! Owns the replica's periodic token (validated at startup, self-renewed
//! for the process lifetime), mints wrapped AppRole secret-ids with a
//! response-wrapping TTL, and issues the TLS certificates backing the
//! metrics endpoint, renewing them continuously. Token and certificate
//! renewal share one loop implementation in [`mod@renew`].

mod api;
mod ca;
mod cert;
mod metrics;
mod renew;

pub use self::ca::{CaFile, RootCaSource, VaultCaBackends};
pub use self::cert::CertificateLease;
pub use self::metrics::VaultMetrics;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_common::WrappedSecretId;

use self::api::{RoleData, Secret, TokenData};
use self::renew::{Renewal, RenewalCounters};

/// Deadline for calls against the Vault server.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Only secret-id creation is response-wrapped; everything else is not.
static WRAPPED_SECRET_ID_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"auth/approle/role/.+/secret-id").expect("static regex"));

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("vault returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid vault token: {0}")]
    InvalidToken(String),

    #[error("invalid token role ({role}): {reasons}")]
    InvalidRole { role: String, reasons: String },

    #[error("malformed vault response: {0}")]
    Malformed(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Connection settings for [`Vault::new`].
pub struct VaultConfig {
    pub addr: String,
    pub token: String,
    /// Skip validating that the token is bound to a periodic token role.
    pub skip_token_role_name_validation: bool,
    /// Common name used for issued metrics certificates.
    pub service_name: String,
    /// Response-wrapping TTL for secret-ids, e.g. "60s".
    pub wrapping_ttl: String,
}

/// Authenticated client for the Vault server.
pub struct Vault {
    addr: String,
    http: reqwest::Client,
    token: String,
    wrapping_ttl: String,
    service_name: String,
    /// PEM bundle embedded into every wrapped secret-id so the helper can
    /// verify the Vault server.
    root_cas: Option<String>,
    metrics: Arc<VaultMetrics>,
    shutdown: CancellationToken,
}

impl Vault {
    /// Connect, validate the supplied token, and start the token
    /// self-renewal loop.
    ///
    /// Fails when the token is a root token, non-renewable, has a zero
    /// TTL, or (unless skipped) is not bound to a renewable periodic
    /// token role without an explicit max TTL.
    pub async fn new(
        config: VaultConfig,
        ca_source: Option<&dyn RootCaSource>,
        metrics: Arc<VaultMetrics>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let root_cas = match ca_source {
            Some(source) => Some(source.root_cas().await?),
            None => None,
        };

        let mut builder = reqwest::Client::builder();

        if let Some(bundle) = &root_cas {
            for cert in reqwest::Certificate::from_pem_bundle(bundle.as_bytes())? {
                builder = builder.add_root_certificate(cert);
            }
        }

        let vault = Arc::new(Self {
            addr: config.addr.trim_end_matches('/').to_string(),
            http: builder.build()?,
            token: config.token,
            wrapping_ttl: config.wrapping_ttl,
            service_name: config.service_name,
            root_cas,
            metrics,
            shutdown,
        });

        let token_data = vault
            .parse_token(config.skip_token_role_name_validation)
            .await?;

        vault.spawn_token_renewal(token_data.ttl);

        Ok(vault)
    }

    /// Mint a wrapped secret-id for an AppRole.
    pub async fn get_secret_id(&self, role: &str) -> Result<WrappedSecretId> {
        let path = format!("auth/approle/role/{role}/secret-id");
        let result = self.write(&path, &serde_json::json!({})).await;

        self.metrics
            .secret_id_requests
            .with_label_values(&[role])
            .inc();

        let secret = match result {
            Ok(secret) => secret,
            Err(error) => {
                self.metrics
                    .secret_id_request_failures
                    .with_label_values(&[role])
                    .inc();
                return Err(error);
            }
        };

        let wrap = secret
            .wrap_info
            .ok_or_else(|| VaultError::Malformed("secret-id response has no wrap_info".into()))?;

        Ok(WrappedSecretId {
            secret_id: wrap.token,
            creation_time: wrap.creation_time,
            ttl: wrap.ttl,
            vault_addr: self.addr.clone(),
            vault_cas: self.root_cas.clone(),
        })
    }

    /// Fetch the root certificates of PKI backends, as one PEM bundle.
    ///
    /// Used to build the client-CA pool for the metrics endpoint.
    pub async fn root_certificates(&self, backends: &[String]) -> Result<String> {
        let mut bundle = String::new();

        for backend in backends {
            let secret = self.read(&format!("{backend}/cert/ca")).await?;
            let certificate = secret
                .data
                .as_ref()
                .and_then(|data| data.get("certificate"))
                .and_then(|value| value.as_str())
                .ok_or_else(|| {
                    VaultError::Malformed(format!("no certificate in {backend}/cert/ca"))
                })?;

            bundle.push_str(certificate);
            bundle.push('\n');
        }

        Ok(bundle)
    }

    // ── Token validation and renewal ───────────────────────────────

    async fn parse_token(&self, skip_role_name_validation: bool) -> Result<TokenData> {
        let secret = self.read("auth/token/lookup-self").await?;
        let data: TokenData = api::decode_data(&secret)?;

        validate_token_data(&data, skip_role_name_validation)?;

        if !skip_role_name_validation {
            let role = self.read(&format!("auth/token/roles/{}", data.role)).await?;
            let role_data: RoleData = api::decode_data(&role)?;
            validate_role_data(&data.role, &role_data)?;
        }

        Ok(data)
    }

    fn spawn_token_renewal(self: &Arc<Self>, initial_ttl: u64) {
        let vault = Arc::clone(self);

        renew::spawn(
            initial_ttl,
            RenewalCounters {
                attempts: self.metrics.token_renewal_requests.clone(),
                failures: self.metrics.token_renewal_failures.clone(),
            },
            self.shutdown.clone(),
            move || {
                let vault = Arc::clone(&vault);
                async move {
                    let secret = vault
                        .write("auth/token/renew-self", &serde_json::json!({}))
                        .await?;
                    let auth = secret.auth.ok_or_else(|| {
                        VaultError::Malformed("renew-self response has no auth block".into())
                    })?;
                    Ok(Renewal {
                        ttl: auth.lease_duration,
                        payload: (),
                    })
                }
            },
            |()| {},
            |error| tracing::error!(%error, "Could not renew vault token"),
        );
    }

    // ── HTTP plumbing ──────────────────────────────────────────────

    async fn read(&self, path: &str) -> Result<Secret> {
        let response = self
            .http
            .get(format!("{}/v1/{path}", self.addr))
            .header("X-Vault-Token", &self.token)
            .timeout(API_TIMEOUT)
            .send()
            .await?;

        check_response(response).await
    }

    async fn write(&self, path: &str, body: &serde_json::Value) -> Result<Secret> {
        let mut request = self
            .http
            .put(format!("{}/v1/{path}", self.addr))
            .header("X-Vault-Token", &self.token)
            .timeout(API_TIMEOUT)
            .json(body);

        if wrap_ttl_applies("PUT", path) {
            request = request.header("X-Vault-Wrap-TTL", &self.wrapping_ttl);
        }

        check_response(request.send().await?).await
    }
}

/// Whether a request must carry the response-wrapping TTL header.
///
/// Matches the original wrapping policy: write operations on secret-id
/// creation paths only.
fn wrap_ttl_applies(operation: &str, path: &str) -> bool {
    operation == "PUT" && WRAPPED_SECRET_ID_PATH.is_match(path)
}

fn validate_token_data(data: &TokenData, skip_role_name_validation: bool) -> Result<()> {
    if data.policies.iter().any(|policy| policy == "root") {
        return Err(VaultError::InvalidToken(
            "do not use a root token; use a token generated from a role instead".into(),
        ));
    }

    let mut reasons = Vec::new();

    if !data.renewable {
        reasons.push("token is not renewable");
    }

    if data.creation_ttl == 0 {
        reasons.push("invalid lease duration of zero");
    }

    if data.ttl == 0 {
        reasons.push("token TTL is zero");
    }

    if !skip_role_name_validation && data.role.is_empty() {
        reasons.push("token role name must be set when not using a root token");
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(VaultError::InvalidToken(reasons.join("; ")))
    }
}

fn validate_role_data(role: &str, data: &RoleData) -> Result<()> {
    let mut reasons = Vec::new();

    if !data.renewable {
        reasons.push("role must allow tokens to be renewed");
    }

    if data.explicit_max_ttl != 0 {
        reasons.push("role must not use an explicit max ttl; tokens must be periodic");
    }

    if data.period == 0 {
        reasons.push("role must have a non-zero period to make tokens periodic");
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(VaultError::InvalidRole {
            role: role.to_string(),
            reasons: reasons.join("; "),
        })
    }
}

async fn check_response(response: reqwest::Response) -> Result<Secret> {
    let status = response.status();

    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<api::ApiErrors>(&body)
        .map(|errors| errors.errors.join("; "))
        .unwrap_or(body);

    if status == reqwest::StatusCode::FORBIDDEN {
        Err(VaultError::Unauthorized(message))
    } else {
        Err(VaultError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// The renewing certificate feed consumed by the metrics endpoint.
pub type CertificateStream = mpsc::Receiver<CertificateLease>;
