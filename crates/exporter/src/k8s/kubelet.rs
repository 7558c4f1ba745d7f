//! Pod-resources source reading the kubelet device-plugin checkpoint.
//!
//! The checkpoint file mirrors what the kubelet Pod Resources API
//! reports: which pod UID holds which device IDs per resource name.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tracing::debug;

use crate::k8s::types::KubernetesError;
use crate::k8s::types::PodResourceAssignment;
use crate::k8s::types::PodResourcesSource;

/// Kubelet device state structure matching the checkpoint JSON format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KubeletDeviceState {
    data: DeviceStateData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceStateData {
    pod_device_entries: Option<Vec<PodDeviceEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodDeviceEntry {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    resource_name: String,
    // key is the NUMA index, in most cases "-1"; value is a device ID list
    #[serde(rename = "DeviceIDs")]
    device_ids: HashMap<String, Vec<String>>,
}

pub struct KubeletCheckpointSource {
    checkpoint_path: PathBuf,
    /// Resource names counted as monitored devices, e.g. `nvidia.com/gpu`.
    resource_names: Vec<String>,
}

impl KubeletCheckpointSource {
    pub fn new<P: Into<PathBuf>>(checkpoint_path: P, resource_names: Vec<String>) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            resource_names,
        }
    }

    fn assignments_from(&self, state: KubeletDeviceState) -> Vec<PodResourceAssignment> {
        let mut by_pod: HashMap<String, Vec<String>> = HashMap::new();
        for entry in state.data.pod_device_entries.unwrap_or_default() {
            if !self.resource_names.contains(&entry.resource_name) {
                continue;
            }
            let devices = by_pod.entry(entry.pod_uid).or_default();
            for device_list in entry.device_ids.values() {
                devices.extend(device_list.iter().map(|id| id.to_lowercase()));
            }
        }
        by_pod
            .into_iter()
            .map(|(pod_uid, device_ids)| PodResourceAssignment {
                pod_uid,
                device_ids,
            })
            .collect()
    }
}

#[async_trait]
impl PodResourcesSource for KubeletCheckpointSource {
    async fn list_pod_resources(
        &self,
    ) -> Result<Vec<PodResourceAssignment>, Report<KubernetesError>> {
        let content = tokio::fs::read_to_string(&self.checkpoint_path)
            .await
            .change_context(KubernetesError::PodResourcesUnavailable {
                message: format!(
                    "reading kubelet checkpoint {}",
                    self.checkpoint_path.display()
                ),
            })?;

        let state: KubeletDeviceState = serde_json::from_str(&content).change_context(
            KubernetesError::PodResourcesUnavailable {
                message: format!(
                    "parsing kubelet checkpoint {}",
                    self.checkpoint_path.display()
                ),
            },
        )?;

        let assignments = self.assignments_from(state);
        debug!(
            pods = assignments.len(),
            "Read device assignments from kubelet checkpoint"
        );
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    const CHECKPOINT: &str = r#"{
        "Data": {
            "PodDeviceEntries": [
                {
                    "PodUID": "uid-1",
                    "ContainerName": "trainer",
                    "ResourceName": "nvidia.com/gpu",
                    "DeviceIDs": {"-1": ["GPU-AAA", "GPU-BBB"]},
                    "AllocResp": ""
                },
                {
                    "PodUID": "uid-2",
                    "ContainerName": "sidecar",
                    "ResourceName": "example.com/other",
                    "DeviceIDs": {"-1": ["OTHER-1"]},
                    "AllocResp": ""
                }
            ],
            "RegisteredDevices": {"nvidia.com/gpu": ["GPU-AAA", "GPU-BBB"]}
        },
        "Checksum": 12345
    }"#;

    fn write_checkpoint(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write");
        file
    }

    #[test(tokio::test)]
    async fn parses_entries_for_configured_resource_names_only() {
        let file = write_checkpoint(CHECKPOINT);
        let source =
            KubeletCheckpointSource::new(file.path(), vec!["nvidia.com/gpu".to_string()]);

        let assignments = source.list_pod_resources().await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].pod_uid, "uid-1");
        assert_eq!(
            assignments[0].device_ids,
            vec!["gpu-aaa".to_string(), "gpu-bbb".to_string()]
        );
    }

    #[test(tokio::test)]
    async fn missing_checkpoint_is_a_source_error() {
        let source = KubeletCheckpointSource::new(
            "/nonexistent/kubelet_internal_checkpoint",
            vec!["nvidia.com/gpu".to_string()],
        );
        let err = source.list_pod_resources().await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            KubernetesError::PodResourcesUnavailable { .. }
        ));
    }

    #[test(tokio::test)]
    async fn malformed_checkpoint_is_a_source_error() {
        let file = write_checkpoint("{not json");
        let source =
            KubeletCheckpointSource::new(file.path(), vec!["nvidia.com/gpu".to_string()]);
        assert!(source.list_pod_resources().await.is_err());
    }
}
