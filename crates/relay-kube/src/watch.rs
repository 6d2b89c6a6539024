//! Long-running pod watch with automatic reopen.
//!
//! The API server drops watch connections routinely, so the reopen logic
//! lives here rather than in the consumer. Every reopen passes the last
//! observed resource version so no events are lost while the connection
//! was down (the leader's poll tick covers the case where the server no
//! longer retains that version).

use backoff::ExponentialBackoff;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{convert_pod, Pod, WatchEvent};
use crate::NamespaceMatcher;

/// Server-side expiry for a single watch connection.
const WATCH_TIMEOUT_SECS: u64 = 20;

pub(crate) async fn run(
    http: reqwest::Client,
    api_server: String,
    namespaces: NamespaceMatcher,
    events: mpsc::Sender<Pod>,
    stop: CancellationToken,
) {
    let mut resource_version = String::new();

    loop {
        let open = || async {
            let mut request = http.get(format!("{api_server}/api/v1/pods")).query(&[
                ("watch", "true"),
                ("timeoutSeconds", WATCH_TIMEOUT_SECS.to_string().as_str()),
            ]);

            if !resource_version.is_empty() {
                request = request.query(&[("resourceVersion", resource_version.as_str())]);
            }

            let response = request.send().await.map_err(backoff::Error::transient)?;

            response
                .error_for_status()
                .map_err(backoff::Error::transient)
        };

        let response = tokio::select! {
            _ = stop.cancelled() => return,
            result = backoff::future::retry(ExponentialBackoff::default(), open) => {
                match result {
                    Ok(response) => response,
                    Err(error) => {
                        tracing::error!(%error, "Could not open pod watch, retrying");
                        continue;
                    }
                }
            }
        };

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            buffer.extend_from_slice(&bytes);

                            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                                let line: Vec<u8> = buffer.drain(..=newline).collect();

                                if let Some(pod) =
                                    handle_line(&line, &namespaces, &mut resource_version)
                                {
                                    if events.send(pod).await.is_err() {
                                        // Consumer is gone; nothing left to watch for.
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(error)) => {
                            tracing::error!(%error, "Pod watch stream failed, reopening");
                            break;
                        }
                        None => {
                            tracing::debug!("Pod watch stream ended, reopening");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Parse one line of the watch stream, tracking the resource version.
///
/// Returns a pod only for add/modify transitions of qualifying pods in a
/// watched namespace.
fn handle_line(
    line: &[u8],
    namespaces: &NamespaceMatcher,
    resource_version: &mut String,
) -> Option<Pod> {
    let event: WatchEvent = match serde_json::from_slice(line) {
        Ok(event) => event,
        Err(error) => {
            tracing::debug!(%error, "Skipping unparseable watch event");
            return None;
        }
    };

    if let Some(version) = &event.object.metadata.resource_version {
        resource_version.clone_from(version);
    }

    if event.kind != "ADDED" && event.kind != "MODIFIED" {
        return None;
    }

    if !namespaces.matches(&event.object.metadata.namespace) {
        return None;
    }

    convert_pod(&event.object)
}
