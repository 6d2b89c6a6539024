//! Leader election over a replicated log, via openraft.
//!
//! The log exists purely to elect a leader: the state machine applies
//! nothing and snapshots are empty. Membership changes are the only
//! meaningful entries. The log, vote, and the locally reconciled peer
//! set are durable in a sled database under the configured data
//! directory.

mod network;
mod service;
mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openraft::{BasicNode, Raft, ServerState};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{ClusterError, Result};

use self::network::HttpNetworkFactory;
use self::store::{LogStore, StateMachineStore};

pub type NodeId = u64;

/// The log carries no application commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Noop {}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Noop,
        R = Noop,
        NodeId = NodeId,
        Node = BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// Tree holding the locally reconciled peer set (addresses as keys).
const PEERS_TREE: &str = "peers";

/// How long a membership change may wait for quorum before the caller
/// moves on. The proposal itself keeps going inside raft.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(30);

/// Stable consensus node id for a peer address.
///
/// FNV-1a over the `ip:port` string; the address itself travels in the
/// node record, so collisions would only confuse ids, and 64 bits over a
/// handful of replicas is plenty.
pub fn node_id_for(addr: &str) -> NodeId {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    addr.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

/// The consensus layer as seen by the coordinator.
pub struct Consensus {
    raft: Raft<TypeConfig>,
    peers: sled::Tree,
    addr: String,
    leader_rx: watch::Receiver<bool>,
}

impl Consensus {
    /// Open the durable store, start the raft node and its RPC service,
    /// and bootstrap a single-node cluster if the log is empty.
    ///
    /// `initial_peers` (consensus addresses derived from the current
    /// gossip members) overwrite the stored peer set, so a stale store
    /// does not survive a restart.
    pub async fn start(
        data_dir: &Path,
        bind_addr: IpAddr,
        port: u16,
        initial_peers: &[String],
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let addr = format!("{bind_addr}:{port}");
        let node_id = node_id_for(&addr);

        let db = sled::open(data_dir.join("raft.db"))?;
        let peers = db.open_tree(PEERS_TREE)?;
        let log_store = LogStore::open(&db)?;
        let state_machine = StateMachineStore::default();

        let config = openraft::Config {
            cluster_name: "secret-relay".to_string(),
            heartbeat_interval: 500,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            ..Default::default()
        };
        let config = Arc::new(
            config
                .validate()
                .map_err(|e| ClusterError::Consensus(e.to_string()))?,
        );

        let raft = Raft::new(
            node_id,
            config,
            HttpNetworkFactory::new(),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::Consensus(e.to_string()))?;

        service::serve(raft.clone(), bind_addr, port, shutdown.clone()).await?;

        // Single-node bootstrap. On restart the log already holds a
        // membership entry and initialize reports it; that is fine.
        let mut members = BTreeMap::new();
        members.insert(node_id, BasicNode::new(&addr));

        if let Err(error) = raft.initialize(members).await {
            tracing::debug!(%error, "Raft was already initialized");
        }

        let leader_rx = spawn_leader_watch(&raft, shutdown);

        let consensus = Arc::new(Self {
            raft,
            peers,
            addr,
            leader_rx,
        });

        consensus.set_peers(initial_peers)?;

        Ok(consensus)
    }

    /// The locally stored peer set, own address included.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .iter()
            .keys()
            .filter_map(|key| key.ok())
            .filter_map(|key| String::from_utf8(key.to_vec()).ok())
            .collect();

        if !peers.contains(&self.addr) {
            peers.push(self.addr.clone());
        }

        peers
    }

    /// Replace the locally stored peer set. No log commit happens here;
    /// this is the follower-side half of gossip reconciliation, and the
    /// set a freshly elected leader starts from.
    pub fn set_peers(&self, peers: &[String]) -> Result<()> {
        self.peers.clear()?;

        for peer in peers {
            self.peers.insert(peer.as_bytes(), vec![])?;
        }

        self.peers.flush()?;
        Ok(())
    }

    /// Add a peer through the log. Leader only.
    pub async fn add_peer(&self, peer: &str) -> Result<()> {
        let id = node_id_for(peer);

        // Non-blocking: the joining replica may still be starting its
        // consensus service; promotion commits once it is reachable.
        self.raft
            .add_learner(id, BasicNode::new(peer), false)
            .await
            .map_err(|e| ClusterError::Consensus(e.to_string()))?;

        let mut voters = self.voter_ids();
        voters.insert(id);

        self.change_membership(voters).await?;

        self.record_peer(peer, true)?;
        Ok(())
    }

    /// Remove a peer through the log. Leader only.
    pub async fn remove_peer(&self, peer: &str) -> Result<()> {
        let id = node_id_for(peer);

        let mut voters = self.voter_ids();
        voters.remove(&id);

        self.change_membership(voters).await?;

        self.record_peer(peer, false)?;
        Ok(())
    }

    /// Drive cluster membership to match the locally stored peer set.
    ///
    /// Called on leader-start: followers cannot commit peer changes, so
    /// whatever gossip told them is sitting in the peer store waiting
    /// for the next leader to apply it.
    pub async fn reconcile_membership(&self) -> Result<()> {
        let desired = self.peers();

        let known: BTreeSet<NodeId> = {
            let metrics = self.raft.metrics().borrow().clone();
            metrics
                .membership_config
                .membership()
                .nodes()
                .map(|(id, _)| *id)
                .collect()
        };

        let mut voters = BTreeSet::new();

        for peer in &desired {
            let id = node_id_for(peer);
            voters.insert(id);

            if !known.contains(&id) {
                // Non-blocking: the voter promotion below commits once the
                // new member catches up, and reconciliation must not hang
                // on one slow peer.
                self.raft
                    .add_learner(id, BasicNode::new(peer), false)
                    .await
                    .map_err(|e| ClusterError::Consensus(e.to_string()))?;
            }
        }

        self.change_membership(voters).await?;

        Ok(())
    }

    /// Whether this replica currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    /// Stream of leadership transitions for this replica.
    pub fn leader_changes(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    /// Shut down the raft node.
    pub async fn shutdown(&self) {
        if let Err(error) = self.raft.shutdown().await {
            tracing::error!(%error, "Could not shut down raft");
        }
    }

    async fn change_membership(&self, voters: BTreeSet<NodeId>) -> Result<()> {
        let change = self.raft.change_membership(voters, false);

        match tokio::time::timeout(MEMBERSHIP_TIMEOUT, change).await {
            Ok(result) => result
                .map(|_| ())
                .map_err(|e| ClusterError::Consensus(e.to_string())),
            Err(_) => Err(ClusterError::Consensus(
                "membership change timed out waiting for quorum".to_string(),
            )),
        }
    }

    fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    fn record_peer(&self, peer: &str, present: bool) -> Result<()> {
        if present {
            self.peers.insert(peer.as_bytes(), vec![])?;
        } else {
            self.peers.remove(peer.as_bytes())?;
        }
        self.peers.flush()?;
        Ok(())
    }
}

/// Translate the raft metrics stream into a boolean leadership stream.
fn spawn_leader_watch(
    raft: &Raft<TypeConfig>,
    shutdown: CancellationToken,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let mut metrics = raft.metrics();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = metrics.changed() => {
                    if changed.is_err() {
                        return;
                    }

                    let is_leader = metrics.borrow().state == ServerState::Leader;

                    // Only transitions are interesting downstream.
                    if *tx.borrow() != is_leader && tx.send(is_leader).is_err() {
                        return;
                    }
                }
            }
        }
    });

    rx
}
