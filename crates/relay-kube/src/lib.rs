//! Kubernetes API client for the controller.
//!
//! Talks to the API server directly over its REST interface using the
//! pod's service-account credentials. The controller only needs a narrow
//! slice of the API: listing and watching pods that request a secret, and
//! resolving the endpoint addresses of its own service for gossip
//! seeding.

mod metrics;
mod types;
mod watch;

pub use self::metrics::KubeMetrics;
pub use self::types::Pod;

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::types::{Endpoints, PodList};

/// Pod annotation naming the AppRole to issue a secret-id for.
pub const ROLE_ANNOTATION: &str = "pod.secret-relay.dev/vault-approle";

/// Pod annotation naming the init container that receives the secret-id.
pub const INIT_CONTAINER_ANNOTATION: &str = "pod.secret-relay.dev/vault-init-container";

/// Deadline for list and endpoint calls against the API server.
const API_TIMEOUT: Duration = Duration::from_secs(20);

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("invalid watch namespace: {0}")]
    InvalidNamespace(#[from] regex::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("not running inside a cluster: {0}")]
    OutOfCluster(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KubeError>;

/// Matches namespaces against the configured watch expression.
///
/// A value starting with `~` is treated as a case-insensitive, unanchored
/// regular expression; anything else matches the namespace exactly
/// (still case-insensitively).
#[derive(Debug, Clone)]
pub struct NamespaceMatcher {
    regex: Regex,
}

impl NamespaceMatcher {
    pub fn new(watch_namespace: &str) -> Result<Self> {
        let pattern = match watch_namespace.strip_prefix('~') {
            Some(expr) => format!("(?i){expr}"),
            None => format!("(?i)^{}$", regex::escape(watch_namespace)),
        };

        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }

    pub fn matches(&self, namespace: &str) -> bool {
        self.regex.is_match(namespace)
    }
}

/// Client for the Kubernetes API server.
pub struct Kube {
    http: reqwest::Client,
    api_server: String,
    namespaces: NamespaceMatcher,
    metrics: Arc<KubeMetrics>,
}

impl Kube {
    /// Build a client from the in-cluster service-account environment.
    pub fn in_cluster(watch_namespace: &str, metrics: Arc<KubeMetrics>) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| KubeError::OutOfCluster("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| KubeError::OutOfCluster("KUBERNETES_SERVICE_PORT is not set".into()))?;

        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))?;
        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))?;

        Self::new(
            &format!("https://{host}:{port}"),
            token.trim(),
            Some(&ca),
            watch_namespace,
            metrics,
        )
    }

    /// Build a client against an explicit API server address.
    pub fn new(
        api_server: &str,
        token: &str,
        ca_pem: Option<&[u8]>,
        watch_namespace: &str,
        metrics: Arc<KubeMetrics>,
    ) -> Result<Self> {
        let namespaces = NamespaceMatcher::new(watch_namespace)?;

        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| KubeError::OutOfCluster(format!("invalid bearer token: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder().default_headers(headers);

        if let Some(pem) = ca_pem {
            for cert in reqwest::Certificate::from_pem_bundle(pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        Ok(Self {
            http: builder.build()?,
            api_server: api_server.trim_end_matches('/').to_string(),
            namespaces,
            metrics,
        })
    }

    /// List every qualifying pod in the watched namespaces.
    ///
    /// A pod qualifies when it carries both the approle and init-container
    /// annotations and the named init container is currently running.
    /// Anything else is silently skipped.
    pub async fn get_pods(&self) -> Result<Vec<Pod>> {
        let path = "/api/v1/pods";
        let response = self
            .http
            .get(format!("{}{path}", self.api_server))
            .timeout(API_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(KubeError::Status {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }

        let list: PodList = response.json().await?;

        Ok(list
            .items
            .iter()
            .filter(|pod| self.namespaces.matches(&pod.metadata.namespace))
            .filter_map(types::convert_pod)
            .collect())
    }

    /// Stream qualifying pods on add/modify transitions.
    ///
    /// Returns the event receiver and a stop token. The watch survives
    /// upstream disconnects: it reopens from the last observed resource
    /// version with exponential backoff until the stop token fires.
    pub fn watch_pods(&self) -> (mpsc::Receiver<Pod>, CancellationToken) {
        let (tx, rx) = mpsc::channel(1024);
        let stop = CancellationToken::new();

        tokio::spawn(watch::run(
            self.http.clone(),
            self.api_server.clone(),
            self.namespaces.clone(),
            tx,
            stop.clone(),
        ));

        (rx, stop)
    }

    /// Resolve the peer addresses behind a service.
    ///
    /// Both ready and not-ready endpoint addresses are returned: replicas
    /// that are still starting up must be reachable for gossip seeding.
    pub async fn discover(&self, service_namespace: &str, service: &str) -> Result<Vec<String>> {
        let path = format!("/api/v1/namespaces/{service_namespace}/endpoints/{service}");
        let response = self
            .http
            .get(format!("{}{path}", self.api_server))
            .timeout(API_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(KubeError::Status {
                status: response.status().as_u16(),
                path,
            });
        }

        let endpoints: Endpoints = response.json().await?;

        let mut ips = Vec::new();

        for subset in &endpoints.subsets {
            for address in &subset.addresses {
                ips.push(address.ip.clone());
            }
            for address in &subset.not_ready_addresses {
                ips.push(address.ip.clone());
            }
        }

        self.metrics.discovered_nodes.set(ips.len() as f64);

        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Namespace matching ─────────────────────────────────────────

    #[test]
    fn literal_namespace_matches_exactly() {
        let m = NamespaceMatcher::new("default").unwrap();
        assert!(m.matches("default"));
        assert!(!m.matches("default2"));
        assert!(!m.matches("not-default"));
    }

    #[test]
    fn literal_namespace_is_case_insensitive() {
        let m = NamespaceMatcher::new("kube-system").unwrap();
        assert!(m.matches("Kube-System"));
    }

    #[test]
    fn literal_namespace_escapes_regex_metacharacters() {
        let m = NamespaceMatcher::new("team.a").unwrap();
        assert!(m.matches("team.a"));
        assert!(!m.matches("teamxa"));
    }

    #[test]
    fn tilde_namespace_is_a_regex() {
        let m = NamespaceMatcher::new("~prod-.*").unwrap();
        assert!(m.matches("prod-us"));
        assert!(m.matches("Prod-Us"));
        assert!(!m.matches("staging"));
    }

    #[test]
    fn tilde_namespace_is_unanchored() {
        let m = NamespaceMatcher::new("~prod").unwrap();
        assert!(m.matches("my-prod-apps"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        assert!(NamespaceMatcher::new("~prod-(").is_err());
    }
}
