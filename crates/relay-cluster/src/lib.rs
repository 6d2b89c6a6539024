//! The cluster core: gossip membership, leader election, and the
//! leader's secret-push pipeline.
//!
//! Gossip is the source of truth for which replicas are alive; the
//! consensus layer decides which one leads. The [`Coordinator`] wires
//! the two together — membership events flow one way, from gossip into
//! the consensus peer set — and runs the work pipeline while this
//! replica holds leadership.

pub mod consensus;
mod coordinator;
mod gossip;
mod metrics;

pub use self::consensus::Consensus;
pub use self::coordinator::{consensus_peer, Coordinator, CoordinatorConfig};
pub use self::gossip::{Gossip, GossipConfig, MemberEvent, MemberEventKind};
pub use self::metrics::ClusterMetrics;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("gossip error: {0}")]
    Gossip(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Storage(#[from] sled::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
