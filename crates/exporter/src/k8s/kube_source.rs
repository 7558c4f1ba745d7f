//! Cluster-API-backed pod metadata source.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use tokio::sync::Mutex;
use tracing::debug;

use crate::k8s::types::ClusterPodSource;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::PodDetails;

/// Looks pods up by UID via the cluster API, scoped to this node.
///
/// The Pod Resources view only carries pod UIDs, while the cluster API
/// is keyed by namespace/name; the source keeps a short-lived UID index
/// of the node's pods and relists on a miss, at most once per
/// `RELIST_COOLDOWN`, so a burst of vanished pods cannot turn one
/// refresh into a list storm.
pub struct KubeClusterPodSource {
    client: Client,
    node_name: String,
    by_uid: Mutex<UidIndex>,
}

struct UidIndex {
    pods: HashMap<String, PodDetails>,
    listed_at: Option<Instant>,
}

const RELIST_COOLDOWN: Duration = Duration::from_secs(10);

impl KubeClusterPodSource {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            by_uid: Mutex::new(UidIndex {
                pods: HashMap::new(),
                listed_at: None,
            }),
        }
    }

    /// Connects using an explicit kubeconfig path when given, otherwise
    /// the default chain (in-cluster config, then `~/.kube/config`).
    pub async fn connect(
        kubeconfig: Option<&Path>,
        node_name: impl Into<String>,
    ) -> Result<Self, Report<KubernetesError>> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).change_context(
                    KubernetesError::ConnectionFailed {
                        message: format!("reading kubeconfig at {}", path.display()),
                    },
                )?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .change_context(KubernetesError::ConnectionFailed {
                            message: format!("loading client config from {}", path.display()),
                        })?;
                Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
                    message: "building client from kubeconfig".to_string(),
                })?
            }
            None => Client::try_default()
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: "building client from the default config chain".to_string(),
                })?,
        };
        Ok(Self::new(client, node_name))
    }

    async fn relist(&self, index: &mut UidIndex) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let pods = api
            .list(&params)
            .await
            .change_context(KubernetesError::PodListFailed {
                message: format!("listing pods on node {}", self.node_name),
            })?;

        index.pods = pods
            .into_iter()
            .filter_map(|pod| {
                let uid = pod.metadata.uid.clone()?;
                Some((
                    uid,
                    PodDetails {
                        namespace: pod.metadata.namespace.unwrap_or_default(),
                        name: pod.metadata.name.unwrap_or_default(),
                        labels: pod.metadata.labels.unwrap_or_default(),
                        annotations: pod.metadata.annotations.unwrap_or_default(),
                    },
                ))
            })
            .collect();
        index.listed_at = Some(Instant::now());
        debug!(
            node = %self.node_name,
            pods = index.pods.len(),
            "Relisted node pods for UID lookup"
        );
        Ok(())
    }
}

#[async_trait]
impl ClusterPodSource for KubeClusterPodSource {
    async fn get_pod(&self, pod_uid: &str) -> Result<Option<PodDetails>, Report<KubernetesError>> {
        let mut index = self.by_uid.lock().await;
        if let Some(details) = index.pods.get(pod_uid) {
            return Ok(Some(details.clone()));
        }

        let stale = index
            .listed_at
            .map_or(true, |at| at.elapsed() >= RELIST_COOLDOWN);
        if stale {
            self.relist(&mut index).await?;
        }
        Ok(index.pods.get(pod_uid).cloned())
    }
}
