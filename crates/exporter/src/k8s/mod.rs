//! Kubernetes integration module.
//!
//! Correlates devices with the pods using them:
//! - [`PodMetadataCache`]: background-refreshed device-to-pod index
//! - [`KubeletCheckpointSource`]: device assignments from the kubelet
//! - [`KubeClusterPodSource`]: pod metadata from the cluster API

pub mod kube_source;
pub mod kubelet;
pub mod pod_cache;
pub mod types;

pub use kube_source::KubeClusterPodSource;
pub use kubelet::KubeletCheckpointSource;
pub use pod_cache::CacheState;
pub use pod_cache::PodCacheSettings;
pub use pod_cache::PodMetadataCache;
pub use types::ClusterPodSource;
pub use types::DeviceToPodIndex;
pub use types::KubernetesError;
pub use types::PodRecord;
pub use types::PodResourcesSource;
