//! Serde models for the slice of the Kubernetes API the controller reads.

use std::collections::HashMap;

use serde::Deserialize;

use crate::{INIT_CONTAINER_ANNOTATION, ROLE_ANNOTATION};

/// A pod that qualifies for a secret-id push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub role: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PodList {
    #[serde(default)]
    pub items: Vec<ApiPod>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiPod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PodStatus {
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    #[serde(rename = "initContainerStatuses", default)]
    pub init_container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ContainerState {
    pub running: Option<ContainerStateRunning>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContainerStateRunning {
    #[serde(rename = "startedAt")]
    #[allow(dead_code)]
    pub started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Endpoints {
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(rename = "notReadyAddresses", default)]
    pub not_ready_addresses: Vec<EndpointAddress>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EndpointAddress {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub object: ApiPod,
}

/// Derive a push target from a pod, or `None` if it does not qualify.
///
/// Requires the approle annotation, the init-container annotation, an
/// assigned pod IP, and the named init container to be in the running
/// state as reported by the structured container status.
pub(crate) fn convert_pod(pod: &ApiPod) -> Option<Pod> {
    let role = pod.metadata.annotations.get(ROLE_ANNOTATION)?;
    let init_container = pod.metadata.annotations.get(INIT_CONTAINER_ANNOTATION)?;
    let ip = pod.status.pod_ip.as_ref()?;

    let init_running = pod
        .status
        .init_container_statuses
        .iter()
        .any(|status| &status.name == init_container && status.state.running.is_some());

    if !init_running {
        return None;
    }

    Some(Pod {
        name: pod.metadata.name.clone(),
        role: role.clone(),
        ip: ip.clone(),
        port: relay_common::HELPER_PORT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qualifying_pod_json() -> serde_json::Value {
        serde_json::json!({
            "metadata": {
                "name": "app-1",
                "namespace": "default",
                "resourceVersion": "1234",
                "annotations": {
                    ROLE_ANNOTATION: "app-a",
                    INIT_CONTAINER_ANNOTATION: "vault-init"
                }
            },
            "status": {
                "podIP": "10.0.0.5",
                "initContainerStatuses": [
                    {"name": "vault-init", "state": {"running": {"startedAt": "2024-01-01T00:00:00Z"}}}
                ]
            }
        })
    }

    fn parse(value: serde_json::Value) -> ApiPod {
        serde_json::from_value(value).unwrap()
    }

    // ── Pod qualification ──────────────────────────────────────────

    #[test]
    fn qualifying_pod_converts() {
        let pod = convert_pod(&parse(qualifying_pod_json())).unwrap();
        assert_eq!(pod.name, "app-1");
        assert_eq!(pod.role, "app-a");
        assert_eq!(pod.ip, "10.0.0.5");
        assert_eq!(pod.port, relay_common::HELPER_PORT);
    }

    #[test]
    fn pod_without_role_annotation_is_skipped() {
        let mut value = qualifying_pod_json();
        value["metadata"]["annotations"]
            .as_object_mut()
            .unwrap()
            .remove(ROLE_ANNOTATION);
        assert!(convert_pod(&parse(value)).is_none());
    }

    #[test]
    fn pod_without_init_container_annotation_is_skipped() {
        let mut value = qualifying_pod_json();
        value["metadata"]["annotations"]
            .as_object_mut()
            .unwrap()
            .remove(INIT_CONTAINER_ANNOTATION);
        assert!(convert_pod(&parse(value)).is_none());
    }

    #[test]
    fn pod_with_waiting_init_container_is_skipped() {
        let mut value = qualifying_pod_json();
        value["status"]["initContainerStatuses"][0]["state"] =
            serde_json::json!({"waiting": {"reason": "PodInitializing"}});
        assert!(convert_pod(&parse(value)).is_none());
    }

    #[test]
    fn pod_with_differently_named_init_container_is_skipped() {
        let mut value = qualifying_pod_json();
        value["status"]["initContainerStatuses"][0]["name"] = "other-init".into();
        assert!(convert_pod(&parse(value)).is_none());
    }

    #[test]
    fn pod_without_ip_is_skipped() {
        let mut value = qualifying_pod_json();
        value["status"].as_object_mut().unwrap().remove("podIP");
        assert!(convert_pod(&parse(value)).is_none());
    }

    // ── Wire parsing ───────────────────────────────────────────────

    #[test]
    fn endpoints_collect_ready_and_not_ready_addresses() {
        let endpoints: Endpoints = serde_json::from_value(serde_json::json!({
            "subsets": [{
                "addresses": [{"ip": "10.0.0.1"}, {"ip": "10.0.0.2"}],
                "notReadyAddresses": [{"ip": "10.0.0.3"}]
            }]
        }))
        .unwrap();

        assert_eq!(endpoints.subsets[0].addresses.len(), 2);
        assert_eq!(endpoints.subsets[0].not_ready_addresses.len(), 1);
        assert_eq!(endpoints.subsets[0].not_ready_addresses[0].ip, "10.0.0.3");
    }

    #[test]
    fn watch_event_parses_type_and_object() {
        let mut event = serde_json::Map::new();
        event.insert("type".into(), "ADDED".into());
        event.insert("object".into(), qualifying_pod_json());

        let event: WatchEvent = serde_json::from_value(event.into()).unwrap();
        assert_eq!(event.kind, "ADDED");
        assert_eq!(event.object.metadata.name, "app-1");
        assert_eq!(event.object.metadata.resource_version.as_deref(), Some("1234"));
    }

    #[test]
    fn pod_list_tolerates_missing_items() {
        let list: PodList = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(list.items.is_empty());
    }
}
