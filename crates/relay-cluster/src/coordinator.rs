//! The per-replica owner of the cluster's moving parts.
//!
//! One coordinator runs per replica. It reflects gossip membership into
//! the consensus peer set (the one-directional coupling: gossip is never
//! read back out of consensus), reacts to leadership transitions, and —
//! while this replica leads — runs the pipeline that observes pods and
//! pushes wrapped secret-ids into them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_common::{DEFAULT_POLL_PODS_FREQUENCY, HTTP_POST_TIMEOUT, MAX_HTTP_POST_TIME};
use relay_kube::{Kube, Pod};
use relay_vault::Vault;

use crate::consensus::Consensus;
use crate::gossip::{Gossip, MemberEvent, MemberEventKind};
use crate::{ClusterMetrics, Result};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval of the safety-net pod listing while leading.
    pub poll_pods_frequency: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_pods_frequency: DEFAULT_POLL_PODS_FREQUENCY,
        }
    }
}

pub struct Coordinator {
    gossip: Gossip,
    consensus: Arc<Consensus>,
    kube: Arc<Kube>,
    vault: Arc<Vault>,
    push_client: reqwest::Client,
    metrics: Arc<ClusterMetrics>,
    config: CoordinatorConfig,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        gossip: Gossip,
        consensus: Arc<Consensus>,
        kube: Arc<Kube>,
        vault: Arc<Vault>,
        metrics: Arc<ClusterMetrics>,
        config: CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        // The helper presents a self-signed, short-lived certificate, so
        // verification is off; trust comes from the orchestrator handing
        // us the pod IP.
        let push_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            gossip,
            consensus,
            kube,
            vault,
            push_client,
            metrics,
            config,
            shutdown,
        })
    }

    /// Run until the process shutdown token fires.
    pub async fn run(self, mut member_events: mpsc::Receiver<MemberEvent>) {
        let mut leader_rx = self.consensus.leader_changes();
        let mut leader_shutdown: Option<CancellationToken> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                event = member_events.recv() => {
                    match event {
                        Some(event) => self.handle_membership_change(&event).await,
                        None => {
                            tracing::error!("Gossip event stream closed");
                            break;
                        }
                    }
                }

                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        tracing::error!("Leadership stream closed");
                        break;
                    }

                    let is_leader = *leader_rx.borrow_and_update();
                    self.metrics.leader_changes_seen.inc();

                    if is_leader {
                        tracing::info!("Gained leadership");

                        let token = CancellationToken::new();
                        leader_shutdown = Some(token.clone());

                        let worker = LeaderWorker {
                            kube: Arc::clone(&self.kube),
                            vault: Arc::clone(&self.vault),
                            push_client: self.push_client.clone(),
                            metrics: Arc::clone(&self.metrics),
                            poll_frequency: self.config.poll_pods_frequency,
                            pods: Arc::new(Mutex::new(HashMap::new())),
                            shutdown: token,
                        };

                        tokio::spawn(worker.run(Arc::clone(&self.consensus)));
                    } else {
                        tracing::info!("Lost leadership");

                        if let Some(token) = leader_shutdown.take() {
                            token.cancel();
                        }
                    }
                }
            }
        }

        if let Some(token) = leader_shutdown.take() {
            token.cancel();
        }

        self.consensus.shutdown().await;
        self.gossip.shutdown();
    }

    /// Reflect one gossip event into the consensus peer set.
    ///
    /// The leader commits the change through the log; a follower only
    /// refreshes its local peer store so the next leader starts from an
    /// accurate set.
    async fn handle_membership_change(&self, event: &MemberEvent) {
        let peer = consensus_peer(event.addr);
        let node = event.addr.ip().to_string();

        match event.kind {
            MemberEventKind::Joined => {
                self.metrics.nodes_joined.with_label_values(&[&node]).inc();

                if self.consensus.is_leader() {
                    if let Err(error) = self.consensus.add_peer(&peer).await {
                        tracing::error!(%error, peer, "Could not add peer to cluster as leader");
                    }
                } else {
                    let peers = add_unique_peer(self.consensus.peers(), &peer);

                    if let Err(error) = self.consensus.set_peers(&peers) {
                        tracing::error!(%error, peer, "Could not add peer to local peer store");
                    }
                }
            }

            MemberEventKind::Left | MemberEventKind::Failed | MemberEventKind::Reaped => {
                let counter = match event.kind {
                    MemberEventKind::Left => &self.metrics.nodes_left,
                    MemberEventKind::Failed => &self.metrics.nodes_failed,
                    _ => &self.metrics.nodes_reaped,
                };
                counter.with_label_values(&[&node]).inc();

                if self.consensus.is_leader() {
                    if let Err(error) = self.consensus.remove_peer(&peer).await {
                        tracing::error!(%error, peer, "Could not remove peer from cluster as leader");
                    }
                } else {
                    let peers = exclude_peer(self.consensus.peers(), &peer);

                    if let Err(error) = self.consensus.set_peers(&peers) {
                        tracing::error!(%error, peer, "Could not remove peer from local peer store");
                    }
                }
            }
        }

        self.metrics
            .nodes_total
            .set(self.consensus.peers().len() as f64);
    }
}

/// Map a member's gossip address to its consensus peer address.
pub fn consensus_peer(addr: SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port() + 1)
}

fn add_unique_peer(mut peers: Vec<String>, peer: &str) -> Vec<String> {
    if !peers.iter().any(|existing| existing == peer) {
        peers.push(peer.to_string());
    }
    peers
}

fn exclude_peer(mut peers: Vec<String>, peer: &str) -> Vec<String> {
    peers.retain(|existing| existing != peer);
    peers
}

/// The leader's work pipeline, one instance per leadership term.
struct LeaderWorker {
    kube: Arc<Kube>,
    vault: Arc<Vault>,
    push_client: reqwest::Client,
    metrics: Arc<ClusterMetrics>,
    poll_frequency: Duration,
    /// Pods with a push in progress or pending. At most one push per pod
    /// name is in flight during this term.
    pods: Arc<Mutex<HashMap<String, Pod>>>,
    shutdown: CancellationToken,
}

impl LeaderWorker {
    async fn run(self, consensus: Arc<Consensus>) {
        // Followers could only stage peer changes locally; apply them now.
        if let Err(error) = consensus.reconcile_membership().await {
            tracing::error!(%error, "Could not reconcile peers on leader start");
        }

        self.get_pods_and_push().await;

        let mut ticker = tokio::time::interval(self.poll_frequency);
        ticker.tick().await; // immediate first tick; the reconcile above covered it

        let (mut events, mut watch_stop) = self.kube.watch_pods();
        let mut watch_alive = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("Shutting down leader");
                    watch_stop.cancel();
                    return;
                }

                event = events.recv(), if watch_alive => {
                    match event {
                        Some(pod) => self.observe(pod),
                        None => {
                            tracing::error!("Pod watch terminated");
                            watch_alive = false;
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.get_pods_and_push().await;

                    if !watch_alive {
                        watch_stop.cancel();
                        let (new_events, new_stop) = self.kube.watch_pods();
                        events = new_events;
                        watch_stop = new_stop;
                        watch_alive = true;
                    }
                }
            }
        }
    }

    async fn get_pods_and_push(&self) {
        match self.kube.get_pods().await {
            Ok(pods) => {
                for pod in pods {
                    self.observe(pod);
                }
            }
            Err(error) => tracing::error!(%error, "Could not list pods"),
        }
    }

    /// Start a push for a pod unless one is already in flight.
    fn observe(&self, pod: Pod) {
        if !track_pod(&self.pods, &pod) {
            return;
        }

        let vault = Arc::clone(&self.vault);
        let http = self.push_client.clone();
        let metrics = Arc::clone(&self.metrics);
        let pods = Arc::clone(&self.pods);

        tokio::spawn(async move {
            push_secret_id(&http, &vault, &metrics, &pod).await;

            // Release the entry whatever the outcome; a failed pod will
            // be rediscovered by the next poll.
            pods.lock().unwrap().remove(&pod.name);
        });
    }
}

/// Record a pod in the in-flight set. Returns false when a push for this
/// pod name is already in progress.
fn track_pod(pods: &Mutex<HashMap<String, Pod>>, pod: &Pod) -> bool {
    let mut pods = pods.lock().unwrap();

    if pods.contains_key(&pod.name) {
        return false;
    }

    pods.insert(pod.name.clone(), pod.clone());
    true
}

/// Fetch a wrapped secret-id and deliver it to the pod's helper.
async fn push_secret_id(
    http: &reqwest::Client,
    vault: &Vault,
    metrics: &ClusterMetrics,
    pod: &Pod,
) {
    tracing::debug!(pod = %pod.name, "Attempting to push wrapped secret_id");

    let wrapped = match vault.get_secret_id(&pod.role).await {
        Ok(wrapped) => wrapped,
        Err(error) => {
            tracing::error!(pod = %pod.name, role = %pod.role, %error, "Could not get secret_id");
            return;
        }
    };

    let body = match serde_json::to_vec(&wrapped) {
        Ok(body) => body,
        Err(error) => {
            tracing::error!(%error, "Could not serialize wrapped secret to JSON");
            return;
        }
    };

    let url = format!("https://{}:{}/", pod.ip, pod.port);

    let policy = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(MAX_HTTP_POST_TIME))
        .build();

    let result = backoff::future::retry(policy, || {
        let request = http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .timeout(HTTP_POST_TIMEOUT);

        async move {
            let response = request.send().await.map_err(backoff::Error::transient)?;
            response
                .error_for_status()
                .map(|_| ())
                .map_err(backoff::Error::transient)
        }
    })
    .await;

    metrics
        .secret_pushes
        .with_label_values(&[&pod.role])
        .inc();

    match result {
        Ok(()) => {
            tracing::debug!(pod = %pod.name, "Successfully pushed wrapped secret_id");
        }
        Err(error) => {
            metrics
                .secret_push_failures
                .with_label_values(&[&pod.role])
                .inc();
            tracing::error!(pod = %pod.name, %error, "Could not push wrapped secret_id");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str) -> Pod {
        Pod {
            name: name.to_string(),
            role: "app-a".to_string(),
            ip: "10.0.0.5".to_string(),
            port: relay_common::HELPER_PORT,
        }
    }

    // ── Peer address mapping ───────────────────────────────────────

    #[test]
    fn consensus_peer_is_gossip_port_plus_one() {
        let addr: SocketAddr = "10.0.0.7:45678".parse().unwrap();
        assert_eq!(consensus_peer(addr), "10.0.0.7:45679");
    }

    #[test]
    fn add_unique_peer_deduplicates() {
        let peers = vec!["10.0.0.1:45679".to_string()];

        let peers = add_unique_peer(peers, "10.0.0.2:45679");
        assert_eq!(peers.len(), 2);

        let peers = add_unique_peer(peers, "10.0.0.2:45679");
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn exclude_peer_removes_only_the_target() {
        let peers = vec!["10.0.0.1:45679".to_string(), "10.0.0.2:45679".to_string()];

        let peers = exclude_peer(peers, "10.0.0.1:45679");
        assert_eq!(peers, vec!["10.0.0.2:45679".to_string()]);

        let peers = exclude_peer(peers, "10.0.0.9:45679");
        assert_eq!(peers, vec!["10.0.0.2:45679".to_string()]);
    }

    // ── In-flight de-duplication ───────────────────────────────────

    #[test]
    fn duplicate_observations_track_once() {
        let pods = Mutex::new(HashMap::new());

        assert!(track_pod(&pods, &pod("w-1")));
        assert!(!track_pod(&pods, &pod("w-1")));
        assert!(track_pod(&pods, &pod("w-2")));
    }

    #[test]
    fn released_pod_can_be_tracked_again() {
        let pods = Mutex::new(HashMap::new());

        assert!(track_pod(&pods, &pod("w-1")));
        pods.lock().unwrap().remove("w-1");
        assert!(track_pod(&pods, &pod("w-1")));
    }
}
