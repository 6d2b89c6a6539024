//! Raft RPC service: the server side of [`super::network`].

use std::net::{IpAddr, SocketAddr};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::Raft;
use tokio_util::sync::CancellationToken;

use super::{NodeId, TypeConfig};
use crate::Result;

pub(crate) fn router(raft: Raft<TypeConfig>) -> Router {
    Router::new()
        .route("/raft/append-entries", post(append_entries))
        .route("/raft/install-snapshot", post(install_snapshot))
        .route("/raft/vote", post(vote))
        .with_state(raft)
}

/// Bind the consensus port and serve raft RPCs until shutdown.
pub(crate) async fn serve(
    raft: Raft<TypeConfig>,
    bind_addr: IpAddr,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::new(bind_addr, port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Consensus RPC listening");

    let app = router(raft);

    tokio::spawn(async move {
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        if let Err(error) = server.await {
            tracing::error!(%error, "Consensus RPC server failed");
        }
    });

    Ok(())
}

async fn append_entries(
    State(raft): State<Raft<TypeConfig>>,
    Json(rpc): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<std::result::Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(raft.append_entries(rpc).await)
}

async fn install_snapshot(
    State(raft): State<Raft<TypeConfig>>,
    Json(rpc): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<
    std::result::Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>,
> {
    Json(raft.install_snapshot(rpc).await)
}

async fn vote(
    State(raft): State<Raft<TypeConfig>>,
    Json(rpc): Json<VoteRequest<NodeId>>,
) -> Json<std::result::Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(raft.vote(rpc).await)
}
