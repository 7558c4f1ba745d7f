//! The periodic collection loop.
//!
//! Each cycle reads every resolved field group for every resolved
//! device, folds cumulative event counters into their sliding windows,
//! attaches pod and HPC job context, and emits one encoded sample per
//! device on the `metrics` tracing target. A device that fails to read
//! is skipped for the cycle; the loop itself only stops on shutdown.

pub mod encoders;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::KubernetesGpuIdType;
use crate::counters::EventClass;
use crate::counters::WindowedEventCounter;
use crate::devices::BindingError;
use crate::devices::DeviceDomain;
use crate::devices::DeviceEntry;
use crate::devices::FieldGroupHandle;
use crate::devices::FieldValue;
use crate::devices::MonitoringBinding;
use crate::devices::ResolvedDeviceSet;
use crate::fields::catalog;
use crate::fields::group_resolver::ResolvedGroups;
use crate::fields::FieldId;
use crate::hpc::HpcJobMapper;
use crate::k8s::PodMetadataCache;
use self::encoders::create_encoder;
use self::encoders::MetricValue;
use self::encoders::MetricsEncoder;

/// Collection-loop wiring that stays fixed after startup.
pub struct CollectorSettings {
    pub node_name: String,
    pub metrics_format: String,
    pub gpu_id_type: KubernetesGpuIdType,
    pub xid_count_window: usize,
    pub clock_events_count_window: usize,
}

pub struct Collector {
    binding: Arc<dyn MonitoringBinding>,
    devices: ResolvedDeviceSet,
    handles: Vec<FieldGroupHandle>,
    counters: Arc<WindowedEventCounter>,
    pod_cache: Option<Arc<PodMetadataCache>>,
    hpc_jobs: Option<Arc<HpcJobMapper>>,
    encoder: Box<dyn MetricsEncoder>,
    settings: CollectorSettings,
}

impl Collector {
    /// Registers the resolved groups with the monitoring runtime and
    /// assembles the loop.
    pub fn new(
        binding: Arc<dyn MonitoringBinding>,
        devices: ResolvedDeviceSet,
        groups: &ResolvedGroups,
        counters: Arc<WindowedEventCounter>,
        pod_cache: Option<Arc<PodMetadataCache>>,
        hpc_jobs: Option<Arc<HpcJobMapper>>,
        settings: CollectorSettings,
    ) -> Result<Self, BindingError> {
        let mut handles = Vec::with_capacity(groups.groups.len());
        for group in &groups.groups {
            let handle = binding.create_field_group(&group.fields)?;
            debug!(group = %group.name, fields = group.fields.len(), "Registered field group");
            handles.push(handle);
        }

        let encoder = create_encoder(&settings.metrics_format);
        Ok(Self {
            binding,
            devices,
            handles,
            counters,
            pod_cache,
            hpc_jobs,
            encoder,
            settings,
        })
    }

    /// Runs collection cycles until cancelled.
    pub async fn run(&self, interval: Duration, cancellation_token: CancellationToken) {
        info!(
            interval = ?interval,
            devices = self.devices.values().map(Vec::len).sum::<usize>(),
            groups = self.handles.len(),
            "Starting telemetry collection"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Telemetry collection shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    for line in self.collect_once() {
                        tracing::info!(target: "metrics", msg = %line);
                    }
                }
            }
        }
    }

    /// Performs one collection cycle and returns the encoded samples.
    pub fn collect_once(&self) -> Vec<String> {
        let now = SystemTime::now();
        let timestamp = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();

        let mut lines = Vec::new();
        for domain in DeviceDomain::ALL {
            let Some(entries) = self.devices.get(&domain) else {
                continue;
            };
            for entry in entries {
                match self.sample_device(domain, entry, now, timestamp) {
                    Ok(line) => lines.push(line),
                    Err(e) => {
                        warn!(
                            domain = %domain,
                            device = %entry,
                            "Skipping device for this cycle: {e}"
                        );
                    }
                }
            }
        }
        lines
    }

    fn sample_device(
        &self,
        domain: DeviceDomain,
        entry: &DeviceEntry,
        now: SystemTime,
        timestamp: i64,
    ) -> Result<String, BindingError> {
        let device_key = self.device_key(domain, entry)?;

        let mut values: HashMap<FieldId, FieldValue> = HashMap::new();
        for handle in &self.handles {
            values.extend(self.binding.read_fields(*handle, domain, entry)?);
        }

        let mut fields: BTreeMap<String, MetricValue> = BTreeMap::new();
        for (field, value) in &values {
            let name = match field.name() {
                Some(name) => name.to_string(),
                None => format!("field_{field}"),
            };
            fields.insert(
                name,
                match value {
                    FieldValue::Int(v) => MetricValue::Integer(*v),
                    FieldValue::Float(v) => MetricValue::Float(*v),
                },
            );
        }

        // Cumulative event counts fold into their sliding windows; the
        // emitted value is the windowed delta, not the raw counter.
        if let Some(value) = values.get(&catalog::DEV_XID_ERRORS) {
            self.counters
                .record(&device_key, EventClass::Xid, value.as_u64(), now);
            fields.insert(
                "xid_count".to_string(),
                MetricValue::Unsigned(self.counters.query_delta(
                    &device_key,
                    EventClass::Xid,
                    self.settings.xid_count_window,
                )),
            );
        }
        if let Some(value) = values.get(&catalog::DEV_CLOCK_THROTTLE_REASONS) {
            self.counters
                .record(&device_key, EventClass::ClockThrottle, value.as_u64(), now);
            fields.insert(
                "clock_throttle_count".to_string(),
                MetricValue::Unsigned(self.counters.query_delta(
                    &device_key,
                    EventClass::ClockThrottle,
                    self.settings.clock_events_count_window,
                )),
            );
        }

        let mut tags = BTreeMap::from([
            ("node".to_string(), self.settings.node_name.clone()),
            ("domain".to_string(), domain.to_string()),
            ("device".to_string(), device_key.clone()),
        ]);

        if let Some(cache) = &self.pod_cache {
            match cache.lookup(&device_key) {
                Some(record) => {
                    tags.insert("pod".to_string(), record.name.clone());
                    tags.insert("namespace".to_string(), record.namespace.clone());
                    for (key, value) in record.labels.iter().chain(record.annotations.iter()) {
                        tags.insert(key.clone(), value.clone());
                    }
                }
                None => {
                    // An unknown device usually means the assignment
                    // changed after the last refresh.
                    cache.trigger_refresh();
                }
            }
        }
        if domain == DeviceDomain::Gpu {
            if let Some(mapper) = &self.hpc_jobs {
                let jobs = mapper.jobs_for_device(entry.major);
                if !jobs.is_empty() {
                    tags.insert("hpc_job".to_string(), jobs.join(","));
                }
            }
        }

        Ok(self
            .encoder
            .encode(&format!("{domain}_telemetry"), &tags, &fields, timestamp))
    }

    /// Correlation key of a device. GPUs keyed by device name use the
    /// `nvidiaN` form matching their device node; everything else uses
    /// the runtime's identity (GPU UUID).
    fn device_key(
        &self,
        domain: DeviceDomain,
        entry: &DeviceEntry,
    ) -> Result<String, BindingError> {
        if domain == DeviceDomain::Gpu
            && self.settings.gpu_id_type == KubernetesGpuIdType::DeviceName
        {
            return Ok(format!("nvidia{}", entry.major));
        }
        self.binding.device_id(domain, entry)
    }
}
