//! Background-refreshed device-to-pod correlation cache.
//!
//! The refresh task owns the index being built; readers only ever see
//! the previously published index swapped out as a whole. Lookups are
//! lock-free and never observe a partial rebuild.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use error_stack::Report;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::k8s::types::ClusterPodSource;
use crate::k8s::types::DeviceToPodIndex;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::PodRecord;
use crate::k8s::types::PodResourcesSource;

/// Lifecycle of the cache. Warming until the first full index build
/// completes; queries return absent rather than guessing until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    Uninitialized = 0,
    Warming = 1,
    Ready = 2,
    Refreshing = 3,
    Stopped = 4,
}

impl CacheState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CacheState::Warming,
            2 => CacheState::Ready,
            3 => CacheState::Refreshing,
            4 => CacheState::Stopped,
            _ => CacheState::Uninitialized,
        }
    }
}

/// Cache tuning values carried over from the configuration.
#[derive(Debug, Clone)]
pub struct PodCacheSettings {
    /// Label keys allowed to be copied into exported metadata.
    pub inherit_pod_labels: Vec<String>,
    /// Annotation keys allowed to be copied into exported metadata.
    pub inherit_pod_annotations: Vec<String>,
    pub refresh_interval: Duration,
    /// Upper bound on one full refresh, covering all external calls.
    pub source_timeout: Duration,
}

pub struct PodMetadataCache {
    resources: Arc<dyn PodResourcesSource>,
    cluster: Arc<dyn ClusterPodSource>,
    settings: PodCacheSettings,
    /// The published index. Publishing is one atomic pointer swap;
    /// readers clone the `Arc` without taking any lock.
    published: ArcSwapOption<DeviceToPodIndex>,
    state: AtomicU8,
    refresh_failures: AtomicU64,
    refresh_notify: Notify,
}

impl PodMetadataCache {
    pub fn new(
        resources: Arc<dyn PodResourcesSource>,
        cluster: Arc<dyn ClusterPodSource>,
        settings: PodCacheSettings,
    ) -> Self {
        Self {
            resources,
            cluster,
            settings,
            published: ArcSwapOption::empty(),
            state: AtomicU8::new(CacheState::Uninitialized as u8),
            refresh_failures: AtomicU64::new(0),
            refresh_notify: Notify::new(),
        }
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Failed refresh count since start, for observability.
    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    /// Snapshot of the pod currently assigned to a device. Lock-free;
    /// reflects the most recently completed refresh, absent while the
    /// cache is still warming.
    pub fn lookup(&self, device: &str) -> Option<Arc<PodRecord>> {
        self.published
            .load_full()
            .and_then(|index| index.get(device).cloned())
    }

    /// Requests an out-of-band refresh on the next loop iteration.
    pub fn trigger_refresh(&self) {
        self.refresh_notify.notify_one();
    }

    /// Runs the refresh loop until cancelled. A failed refresh keeps
    /// the previously published index and is retried on the next tick
    /// at the unchanged interval.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            interval = ?self.settings.refresh_interval,
            "Starting pod metadata cache"
        );
        self.set_state(CacheState::Warming);

        let mut ticker = tokio::time::interval(self.settings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pod metadata cache shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh_once().await;
                }
                _ = self.refresh_notify.notified() => {
                    self.refresh_once().await;
                }
            }
        }

        self.set_state(CacheState::Stopped);
    }

    /// Performs one bounded refresh cycle. Returns whether a new index
    /// was published.
    pub async fn refresh_once(&self) -> bool {
        let warming = self.published.load().is_none();
        self.set_state(if warming {
            CacheState::Warming
        } else {
            CacheState::Refreshing
        });

        let outcome =
            tokio::time::timeout(self.settings.source_timeout, self.build_index()).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Report::new(KubernetesError::RefreshTimeout {
                seconds: self.settings.source_timeout.as_secs(),
            })),
        };

        match result {
            Ok(index) => {
                debug!(devices = index.len(), "Publishing rebuilt device-to-pod index");
                self.published.store(Some(Arc::new(index)));
                self.set_state(CacheState::Ready);
                true
            }
            Err(e) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Pod metadata refresh failed, keeping previous index: {e:?}");
                self.set_state(if warming {
                    CacheState::Warming
                } else {
                    CacheState::Ready
                });
                false
            }
        }
    }

    /// Builds the next index fully off to the side.
    async fn build_index(&self) -> Result<DeviceToPodIndex, Report<KubernetesError>> {
        let assignments = self.resources.list_pod_resources().await?;

        // Collapse assignments by pod first; the kubelet may report one
        // pod in several entries (one per container). First-seen pod
        // order is kept so a device claimed by two pods
        // deterministically resolves to the later assignment.
        let mut pod_order: Vec<String> = Vec::new();
        let mut devices_by_pod: HashMap<String, Vec<String>> = HashMap::new();
        for assignment in assignments {
            if !devices_by_pod.contains_key(&assignment.pod_uid) {
                pod_order.push(assignment.pod_uid.clone());
            }
            devices_by_pod
                .entry(assignment.pod_uid)
                .or_default()
                .extend(assignment.device_ids);
        }

        let mut index = DeviceToPodIndex::with_capacity(devices_by_pod.len());
        for pod_uid in pod_order {
            let mut device_ids = devices_by_pod.remove(&pod_uid).unwrap_or_default();
            device_ids.sort();
            device_ids.dedup();

            // A missing pod means the metadata pull raced pod deletion;
            // the assignment itself is still real.
            let details = self.cluster.get_pod(&pod_uid).await?.unwrap_or_default();
            let record = Arc::new(PodRecord {
                uid: pod_uid,
                namespace: details.namespace,
                name: details.name,
                labels: filter_keys(&details.labels, &self.settings.inherit_pod_labels),
                annotations: filter_keys(
                    &details.annotations,
                    &self.settings.inherit_pod_annotations,
                ),
                assigned_devices: device_ids.clone(),
            });

            for device in device_ids {
                if let Some(previous) = index.insert(device.clone(), record.clone()) {
                    debug!(
                        device = %device,
                        previous_pod = %previous.uid,
                        pod = %record.uid,
                        "Device reported for more than one pod, keeping the latest"
                    );
                }
            }
        }

        Ok(index)
    }

    fn set_state(&self, next: CacheState) {
        let previous = self.state.swap(next as u8, Ordering::AcqRel);
        if previous != next as u8 {
            debug!(
                from = ?CacheState::from_u8(previous),
                to = ?next,
                "Pod metadata cache state changed"
            );
        }
    }
}

fn filter_keys(
    source: &BTreeMap<String, String>,
    allow_list: &[String],
) -> BTreeMap<String, String> {
    allow_list
        .iter()
        .filter_map(|key| source.get(key).map(|value| (key.clone(), value.clone())))
        .collect()
}
