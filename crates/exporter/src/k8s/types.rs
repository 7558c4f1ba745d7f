use core::error::Error;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;

/// A pod UID together with the devices the kubelet assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodResourceAssignment {
    pub pod_uid: String,
    pub device_ids: Vec<String>,
}

/// Pod identity and metadata as reported by the cluster API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodDetails {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Immutable snapshot of the pod currently using a device. Labels and
/// annotations are already filtered to the configured inherit
/// allow-lists; a full dump never enters the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRecord {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub assigned_devices: Vec<String>,
}

/// Device identity -> currently assigned pod. Rebuilt as a whole on
/// each refresh and published atomically; a device with no assignment
/// is simply absent.
pub type DeviceToPodIndex = HashMap<String, Arc<PodRecord>>;

/// The kubelet Pod Resources view: which pod holds which devices.
#[async_trait]
pub trait PodResourcesSource: Send + Sync {
    async fn list_pod_resources(
        &self,
    ) -> Result<Vec<PodResourceAssignment>, Report<KubernetesError>>;
}

/// The cluster API view: pod metadata looked up by pod UID.
#[async_trait]
pub trait ClusterPodSource: Send + Sync {
    async fn get_pod(&self, pod_uid: &str) -> Result<Option<PodDetails>, Report<KubernetesError>>;
}

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to read pod resource assignments: {message}")]
    PodResourcesUnavailable { message: String },
    #[display("Failed to list pods: {message}")]
    PodListFailed { message: String },
    #[display("Pod metadata refresh timed out after {seconds}s")]
    RefreshTimeout { seconds: u64 },
}

impl Error for KubernetesError {}
