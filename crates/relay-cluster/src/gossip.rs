//! LAN-scale membership over chitchat.
//!
//! Each replica gossips its presence on the configured UDP port and
//! derives membership events from transitions in the live/dead node
//! sets. The gossip layer says who is alive; it never decides who leads.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chitchat::transport::UdpTransport;
use chitchat::{ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ClusterError, Result};

/// How often live/dead sets are compared for membership transitions.
const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a dead node lingers before chitchat garbage-collects it.
/// Its disappearance from the dead set is surfaced as a reap event.
const DEAD_NODE_GRACE_PERIOD: Duration = Duration::from_secs(300);

const MEMBER_EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Gossip addresses of already-running replicas, from peer discovery.
    pub seeds: Vec<String>,
    pub cluster_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Joined,
    Left,
    Failed,
    Reaped,
}

/// A membership transition observed for one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    /// The member's gossip address.
    pub addr: SocketAddr,
}

/// Handle to the running gossip layer.
pub struct Gossip {
    handle: ChitchatHandle,
    self_addr: SocketAddr,
    port: u16,
    cancel: CancellationToken,
}

impl Gossip {
    /// Bind the gossip listener, join the seeds, and start emitting
    /// membership events.
    pub async fn start(
        config: GossipConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<MemberEvent>)> {
        let self_addr = SocketAddr::new(config.bind_addr, config.port);

        // The generation distinguishes restarts of the same address.
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId::new(self_addr.to_string(), generation, self_addr),
            cluster_id: config.cluster_id,
            gossip_interval: Duration::from_millis(500),
            listen_addr: self_addr,
            seed_nodes: config.seeds,
            failure_detector_config: FailureDetectorConfig::default(),
            marked_for_deletion_grace_period: DEAD_NODE_GRACE_PERIOD,
            extra_liveness_predicate: None,
            catchup_callback: None,
        };

        let handle = chitchat::spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| ClusterError::Gossip(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(MEMBER_EVENT_CHANNEL_CAPACITY);

        let cancel = shutdown.child_token();
        let watcher = handle.chitchat().clone();
        let watcher_cancel = cancel.clone();
        let watcher_self = self_addr;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVENT_POLL_INTERVAL);
            let mut live: BTreeSet<SocketAddr> = BTreeSet::new();
            let mut dead: BTreeSet<SocketAddr> = BTreeSet::new();

            loop {
                tokio::select! {
                    _ = watcher_cancel.cancelled() => {
                        tracing::debug!("Gossip event watcher stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        let (next_live, next_dead) = {
                            let guard = watcher.lock().await;
                            let next_live: BTreeSet<SocketAddr> = guard
                                .live_nodes()
                                .map(|id| id.gossip_advertise_addr)
                                .filter(|addr| *addr != watcher_self)
                                .collect();
                            let next_dead: BTreeSet<SocketAddr> = guard
                                .dead_nodes()
                                .map(|id| id.gossip_advertise_addr)
                                .filter(|addr| *addr != watcher_self)
                                .collect();
                            (next_live, next_dead)
                        };

                        for event in
                            diff_membership(&live, &dead, &next_live, &next_dead)
                        {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }

                        live = next_live;
                        dead = next_dead;
                    }
                }
            }
        });

        Ok((
            Self {
                handle,
                self_addr,
                port: config.port,
                cancel,
            },
            events_rx,
        ))
    }

    /// Gossip addresses of all live members, this replica included.
    pub async fn members(&self) -> Vec<SocketAddr> {
        let chitchat = self.handle.chitchat();
        let guard = chitchat.lock().await;

        let mut members: BTreeSet<SocketAddr> =
            guard.live_nodes().map(|id| id.gossip_advertise_addr).collect();
        members.insert(self.self_addr);

        members.into_iter().collect()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop gossiping. The chitchat tasks stop when the handle drops.
    pub fn shutdown(self) {
        self.cancel.cancel();
        drop(self.handle);
    }
}

/// Compute membership events from two consecutive live/dead snapshots.
///
/// A node that was live and is now dead has failed; live and gone
/// entirely means it left cleanly; dead and gone means its grace period
/// expired and it was reaped.
fn diff_membership(
    live: &BTreeSet<SocketAddr>,
    dead: &BTreeSet<SocketAddr>,
    next_live: &BTreeSet<SocketAddr>,
    next_dead: &BTreeSet<SocketAddr>,
) -> Vec<MemberEvent> {
    let mut events = Vec::new();

    for addr in next_live.difference(live) {
        events.push(MemberEvent {
            kind: MemberEventKind::Joined,
            addr: *addr,
        });
    }

    for addr in live.difference(next_live) {
        if next_dead.contains(addr) {
            events.push(MemberEvent {
                kind: MemberEventKind::Failed,
                addr: *addr,
            });
        } else {
            events.push(MemberEvent {
                kind: MemberEventKind::Left,
                addr: *addr,
            });
        }
    }

    for addr in dead.difference(next_dead) {
        if !next_live.contains(addr) {
            events.push(MemberEvent {
                kind: MemberEventKind::Reaped,
                addr: *addr,
            });
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last_octet: u8) -> SocketAddr {
        format!("10.0.0.{last_octet}:45678").parse().unwrap()
    }

    fn set(addrs: &[SocketAddr]) -> BTreeSet<SocketAddr> {
        addrs.iter().copied().collect()
    }

    // ── Membership diffing ─────────────────────────────────────────

    #[test]
    fn new_live_node_joins() {
        let events = diff_membership(&set(&[]), &set(&[]), &set(&[addr(7)]), &set(&[]));
        assert_eq!(
            events,
            vec![MemberEvent {
                kind: MemberEventKind::Joined,
                addr: addr(7)
            }]
        );
    }

    #[test]
    fn live_to_dead_is_a_failure() {
        let events = diff_membership(&set(&[addr(7)]), &set(&[]), &set(&[]), &set(&[addr(7)]));
        assert_eq!(events[0].kind, MemberEventKind::Failed);
    }

    #[test]
    fn live_to_absent_is_a_leave() {
        let events = diff_membership(&set(&[addr(7)]), &set(&[]), &set(&[]), &set(&[]));
        assert_eq!(events[0].kind, MemberEventKind::Left);
    }

    #[test]
    fn dead_to_absent_is_a_reap() {
        let events = diff_membership(&set(&[]), &set(&[addr(7)]), &set(&[]), &set(&[]));
        assert_eq!(events[0].kind, MemberEventKind::Reaped);
    }

    #[test]
    fn dead_node_coming_back_is_a_join_not_a_reap() {
        let events = diff_membership(&set(&[]), &set(&[addr(7)]), &set(&[addr(7)]), &set(&[]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MemberEventKind::Joined);
    }

    #[test]
    fn steady_state_emits_nothing() {
        let live = set(&[addr(1), addr(2)]);
        let dead = set(&[addr(3)]);
        assert!(diff_membership(&live, &dead, &live, &dead).is_empty());
    }

    #[test]
    fn multiple_transitions_in_one_tick() {
        let events = diff_membership(
            &set(&[addr(1), addr(2)]),
            &set(&[]),
            &set(&[addr(1), addr(9)]),
            &set(&[addr(2)]),
        );

        assert_eq!(events.len(), 2);
        assert!(events.contains(&MemberEvent {
            kind: MemberEventKind::Joined,
            addr: addr(9)
        }));
        assert!(events.contains(&MemberEvent {
            kind: MemberEventKind::Failed,
            addr: addr(2)
        }));
    }
}
