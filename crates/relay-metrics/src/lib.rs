//! The observability endpoint.
//!
//! Serves the prometheus scrape endpoint, over HTTPS when a certificate
//! stream is supplied. Certificates arrive from the Vault client's
//! renewal loop and take effect on the next handshake; when a client-CA
//! bundle is configured, scrapers must present a certificate it signed.

mod resolver;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use prometheus::{Encoder, Registry, TextEncoder};
use rustls::server::WebPkiClientVerifier;
use rustls::ServerConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use relay_vault::CertificateStream;

use self::resolver::RotatingCertResolver;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid certificate material: {0}")]
    Certificate(String),

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("no certificate available for the metrics server")]
    NoCertificate,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Start the metrics server in the background.
///
/// With a certificate stream the server speaks HTTPS and follows
/// renewals; without one it speaks plain HTTP. A client-CA bundle makes
/// client certificates required and verified.
pub async fn start(
    addr: SocketAddr,
    registry: Arc<Registry>,
    certificates: Option<CertificateStream>,
    client_ca_pem: Option<Vec<u8>>,
    shutdown: CancellationToken,
) -> Result<(), MetricsError> {
    let app = router(registry);

    let Some(mut certificates) = certificates else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Metrics endpoint listening (http)");

        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });

            if let Err(error) = server.await {
                tracing::error!(%error, "Metrics server failed");
            }
        });

        return Ok(());
    };

    // The Vault client issues the first certificate synchronously, so
    // the stream already holds it.
    let first = certificates.try_recv().map_err(|_| MetricsError::NoCertificate)?;

    let cert_resolver = Arc::new(RotatingCertResolver::default());
    cert_resolver.install(&first)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| MetricsError::Tls(e.to_string()))?;

    let builder = match client_ca_pem {
        Some(pem) => {
            let roots = Arc::new(resolver::client_ca_roots(&pem)?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| MetricsError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let resolver_for_tls: Arc<dyn rustls::server::ResolvesServerCert> =
        Arc::clone(&cert_resolver) as Arc<dyn rustls::server::ResolvesServerCert>;
    let server_config = builder.with_cert_resolver(resolver_for_tls);

    // Reader task: each renewal overwrites the resolver's slot.
    let reader_resolver = Arc::clone(&cert_resolver);
    tokio::spawn(async move {
        while let Some(lease) = certificates.recv().await {
            match reader_resolver.install(&lease) {
                Ok(()) => {
                    tracing::info!(ttl_secs = lease.ttl_secs, "Metrics certificate rotated");
                }
                Err(error) => {
                    tracing::warn!(%error, "Ignoring unusable renewed certificate");
                }
            }
        }
        tracing::debug!("Certificate stream closed");
    });

    let rustls_config = RustlsConfig::from_config(Arc::new(server_config));
    tracing::info!(%addr, "Metrics endpoint listening (https)");

    tokio::spawn(async move {
        let server = axum_server::bind_rustls(addr, rustls_config).serve(app.into_make_service());

        tokio::select! {
            result = server => {
                if let Err(error) = result {
                    tracing::error!(%error, "Metrics server failed");
                }
            }
            _ = shutdown.cancelled() => {}
        }
    });

    Ok(())
}

/// Build the scrape router (public for tests).
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(error) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(%error, "Could not encode metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            [(CONTENT_TYPE, "text/plain".to_string())],
            Vec::new(),
        );
    }

    (
        axum::http::StatusCode::OK,
        [(CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Opts};
    use relay_vault::CertificateLease;
    use tokio::sync::mpsc;

    fn registry_with_counter() -> Arc<Registry> {
        let registry = Registry::new();
        let counter =
            IntCounter::with_opts(Opts::new("pushes_total", "pushes").namespace("secretrelay"))
                .unwrap();
        counter.inc();
        registry.register(Box::new(counter)).unwrap();
        Arc::new(registry)
    }

    fn self_signed_lease(name: &str) -> CertificateLease {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        CertificateLease {
            cert_pem: cert.cert.pem(),
            key_pem: cert.key_pair.serialize_pem(),
            ttl_secs: 3600,
        }
    }

    async fn free_port() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    // ── Plain HTTP ─────────────────────────────────────────────────

    #[tokio::test]
    async fn scrape_over_http() {
        let addr = free_port().await;
        let shutdown = CancellationToken::new();

        start(addr, registry_with_counter(), None, None, shutdown.clone())
            .await
            .unwrap();

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(body.contains("secretrelay_pushes_total 1"));
        shutdown.cancel();
    }

    // ── HTTPS with a certificate stream ────────────────────────────

    #[tokio::test]
    async fn scrape_over_https_with_streamed_certificate() {
        let addr = free_port().await;
        let shutdown = CancellationToken::new();

        let (tx, rx) = mpsc::channel(8);
        tx.try_send(self_signed_lease("localhost")).unwrap();

        start(
            addr,
            registry_with_counter(),
            Some(rx),
            None,
            shutdown.clone(),
        )
        .await
        .unwrap();

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();

        let body = client
            .get(format!("https://{addr}/metrics"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(body.contains("secretrelay_pushes_total 1"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn empty_certificate_stream_is_an_error() {
        let addr = free_port().await;
        let (_tx, rx) = mpsc::channel(8);

        let result = start(
            addr,
            registry_with_counter(),
            Some(rx),
            None,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(MetricsError::NoCertificate)));
    }
}
