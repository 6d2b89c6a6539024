//! secret-relay controller entry point.
//!
//! Watches pods that request a Vault credential and pushes a single-use
//! wrapped secret-id into each one. Replicas discover each other through
//! the controller's Kubernetes service, gossip membership, and elect a
//! leader that runs the push pipeline.

mod config;
mod expand;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prometheus::Registry;
use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_cluster::{
    consensus_peer, ClusterMetrics, Consensus, Coordinator, CoordinatorConfig, Gossip,
    GossipConfig,
};
use relay_common::DEFAULT_GOSSIP_PORT;
use relay_kube::{Kube, KubeMetrics};
use relay_metrics::MetricsError;
use relay_vault::{
    CaFile, CertificateLease, CertificateStream, RootCaSource, Vault, VaultCaBackends,
    VaultConfig, VaultMetrics,
};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "secret-relay",
    version,
    about = "A Kubernetes controller that pushes wrapped Vault secret-ids into pods"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "secret-relay.yml")]
    config: PathBuf,

    /// Log verbosity
    #[arg(long, default_value = "debug", value_parser = ["debug", "error"])]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "secret-relay starting"
    );

    let config = Config::load(&cli.config)?;
    config.validate()?;

    std::fs::create_dir_all(&config.raft_dir)?;

    let bind_addr = relay_common::external_ip()?;
    tracing::info!(%bind_addr, "Using external address");

    let registry = Arc::new(Registry::new());
    let kube_metrics = Arc::new(KubeMetrics::register(&registry)?);
    let vault_metrics = Arc::new(VaultMetrics::register(&registry)?);
    let cluster_metrics = Arc::new(ClusterMetrics::register(&registry)?);

    // Process-wide shutdown stops the coordinator and its children; the
    // vault client's renewal loops stop afterwards, in that order.
    let shutdown = CancellationToken::new();
    let vault_shutdown = CancellationToken::new();

    let kube = Arc::new(Kube::in_cluster(
        &config.kubernetes.watch_namespace,
        Arc::clone(&kube_metrics),
    )?);

    // Spread replica startups a little so peer discovery has a chance to
    // see the others' endpoints.
    let delay = rand::thread_rng().gen_range(3..=10);
    tokio::time::sleep(Duration::from_secs(delay)).await;

    let nodes = kube
        .discover(
            &config.kubernetes.service_namespace,
            &config.kubernetes.service,
        )
        .await?;
    tracing::debug!(count = nodes.len(), ?nodes, "Discovered controller replicas");

    let ca_source: Option<Box<dyn RootCaSource>> =
        if !config.vault.tls.vault_ca_backends.is_empty() {
            Some(Box::new(VaultCaBackends {
                vault_addr: config.vault.addr.clone(),
                backends: config.vault.tls.vault_ca_backends.clone(),
            }))
        } else if !config.vault.tls.ca_cert.is_empty() {
            Some(Box::new(CaFile {
                path: config.vault.tls.ca_cert.clone().into(),
            }))
        } else {
            None
        };

    let vault = Vault::new(
        VaultConfig {
            addr: config.vault.addr.clone(),
            token: config.vault.token.clone(),
            skip_token_role_name_validation: config.vault.skip_token_role_name_validation,
            service_name: config.kubernetes.service.clone(),
            wrapping_ttl: config.vault.wrapping_ttl.clone(),
        },
        ca_source.as_deref(),
        Arc::clone(&vault_metrics),
        vault_shutdown.clone(),
    )
    .await?;

    // TLS material for the metrics endpoint: either minted and renewed
    // by vault, or a static file pair.
    let prometheus_tls = &config.prometheus.tls;

    let certificates: Option<CertificateStream> = if !prometheus_tls.vault_cert_backend.is_empty()
        && !prometheus_tls.vault_cert_role.is_empty()
    {
        Some(
            vault
                .get_and_renew_certificate(
                    bind_addr,
                    &prometheus_tls.vault_cert_backend,
                    &prometheus_tls.vault_cert_role,
                )
                .await?,
        )
    } else if !prometheus_tls.cert_file.is_empty() && !prometheus_tls.cert_key.is_empty() {
        Some(certificate_from_files(
            &prometheus_tls.cert_file,
            &prometheus_tls.cert_key,
        )?)
    } else {
        None
    };

    let client_ca = if !prometheus_tls.vault_ca_backends.is_empty() {
        Some(
            vault
                .root_certificates(&prometheus_tls.vault_ca_backends)
                .await?
                .into_bytes(),
        )
    } else if !prometheus_tls.ca_cert.is_empty() {
        Some(std::fs::read(&prometheus_tls.ca_cert)?)
    } else {
        None
    };

    relay_metrics::start(
        SocketAddr::from(([0, 0, 0, 0], config.prometheus.port)),
        Arc::clone(&registry),
        certificates,
        client_ca,
        shutdown.clone(),
    )
    .await?;

    let seeds = nodes
        .iter()
        .map(|ip| format!("{ip}:{DEFAULT_GOSSIP_PORT}"))
        .collect();

    let (gossip, member_events) = Gossip::start(
        GossipConfig {
            bind_addr,
            port: DEFAULT_GOSSIP_PORT,
            seeds,
            cluster_id: "secret-relay".to_string(),
        },
        shutdown.clone(),
    )
    .await?;

    // Force-set peers from the current gossip members so a stale peer
    // store does not survive the restart.
    let initial_peers: Vec<String> = gossip
        .members()
        .await
        .into_iter()
        .map(consensus_peer)
        .collect();

    let consensus = Consensus::start(
        std::path::Path::new(&config.raft_dir),
        bind_addr,
        gossip.port() + 1,
        &initial_peers,
        shutdown.clone(),
    )
    .await?;

    let coordinator = Coordinator::new(
        gossip,
        consensus,
        kube,
        vault,
        cluster_metrics,
        CoordinatorConfig {
            poll_pods_frequency: Duration::from_secs(config.poll_pods_frequency_secs),
        },
        shutdown.clone(),
    )?;

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("could not register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("could not register SIGINT");

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }

        signal_shutdown.cancel();
    });

    tracing::info!("Ready.");

    coordinator.run(member_events).await;

    // The coordinator is down; stop the renewal loops last.
    vault_shutdown.cancel();

    tracing::info!("Shut down cleanly");
    Ok(())
}

/// Wrap a static certificate pair as a single-element stream.
fn certificate_from_files(
    cert_file: &str,
    cert_key: &str,
) -> Result<CertificateStream, MetricsError> {
    let (tx, rx) = mpsc::channel(1);

    let lease = CertificateLease {
        cert_pem: std::fs::read_to_string(cert_file)?,
        key_pem: std::fs::read_to_string(cert_key)?,
        // Static material never rotates, so no meaningful lifetime.
        ttl_secs: 0,
    };

    tx.try_send(lease)
        .map_err(|_| MetricsError::Certificate("could not stage static certificate".into()))?;

    Ok(rx)
}
