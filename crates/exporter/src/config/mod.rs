//! Runtime configuration assembled from command-line arguments.

pub mod args;

use std::path::PathBuf;
use std::time::Duration;

pub use args::DeviceFilter;
pub use args::ExporterArgs;
pub use args::KubernetesGpuIdType;

use crate::counters::EventClass;
use crate::devices::DeviceDomain;
use crate::devices::DeviceOptions;
use crate::fields::FieldId;
use crate::fields::SubsystemLimits;
use crate::k8s::pod_cache::PodCacheSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub fields: Vec<FieldId>,
    pub collect_dcp: bool,
    pub gpu_devices: Option<DeviceOptions>,
    pub switch_devices: Option<DeviceOptions>,
    pub cpu_devices: Option<DeviceOptions>,
    pub limits: SubsystemLimits,
    pub xid_count_window_size: usize,
    pub clock_events_count_window_size: usize,
    pub collect_interval: Duration,
    pub metrics_format: String,
    pub kubernetes: bool,
    pub kubernetes_gpu_id_type: KubernetesGpuIdType,
    pub node_name: String,
    pub kubeconfig: Option<PathBuf>,
    pub kubelet_device_state_path: PathBuf,
    pub nvidia_resource_names: Vec<String>,
    pub pod_cache: PodCacheSettings,
    pub hpc_job_mapping_dir: Option<PathBuf>,
}

impl Config {
    /// Device filter for a domain, `None` when the domain was not
    /// requested at all.
    pub fn device_options(&self, domain: DeviceDomain) -> Option<&DeviceOptions> {
        match domain {
            DeviceDomain::Gpu => self.gpu_devices.as_ref(),
            DeviceDomain::Switch => self.switch_devices.as_ref(),
            DeviceDomain::Cpu => self.cpu_devices.as_ref(),
        }
    }

    /// Retained-sample budget for a windowed event class.
    pub fn window_size(&self, class: EventClass) -> usize {
        match class {
            EventClass::Xid => self.xid_count_window_size,
            EventClass::ClockThrottle => self.clock_events_count_window_size,
        }
    }

    /// The larger of the per-class windows, used to size shared buffers.
    pub fn max_window_size(&self) -> usize {
        self.xid_count_window_size
            .max(self.clock_events_count_window_size)
    }
}

impl From<&ExporterArgs> for Config {
    fn from(args: &ExporterArgs) -> Self {
        Self {
            fields: args.fields.iter().copied().map(FieldId).collect(),
            collect_dcp: args.collect_dcp,
            gpu_devices: args.gpu_devices.as_options().cloned(),
            switch_devices: args.switch_devices.as_options().cloned(),
            cpu_devices: args.cpu_devices.as_options().cloned(),
            limits: SubsystemLimits {
                max_fields_per_group: args.max_fields_per_group,
                max_groups: args.max_field_groups,
            },
            xid_count_window_size: args.xid_count_window_size,
            clock_events_count_window_size: args.clock_events_count_window_size,
            collect_interval: Duration::from_millis(args.collect_interval_ms),
            metrics_format: args.metrics_format.clone(),
            kubernetes: args.kubernetes,
            kubernetes_gpu_id_type: args.kubernetes_gpu_id_type,
            node_name: args.node_name.clone(),
            kubeconfig: args.kubeconfig.clone(),
            kubelet_device_state_path: args.kubelet_device_state_path.clone(),
            nvidia_resource_names: args.nvidia_resource_names.clone(),
            pod_cache: PodCacheSettings {
                inherit_pod_labels: args.inherit_pod_labels.clone(),
                inherit_pod_annotations: args.inherit_pod_annotations.clone(),
                refresh_interval: Duration::from_secs(args.pod_cache_refresh_interval_secs),
                source_timeout: Duration::from_secs(args.pod_cache_source_timeout_secs),
            },
            hpc_job_mapping_dir: args.hpc_job_mapping_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::fields::catalog;

    #[test]
    fn config_from_default_args() {
        let args = ExporterArgs::parse_from(["exporter"]);
        let config = Config::from(&args);

        assert!(config.fields.contains(&catalog::DEV_GPU_TEMP));
        assert!(config.device_options(DeviceDomain::Gpu).is_some());
        assert!(config.device_options(DeviceDomain::Switch).is_none());
        assert_eq!(config.window_size(EventClass::Xid), 600);
        assert_eq!(config.collect_interval, Duration::from_secs(30));
        assert_eq!(config.limits.capacity(), 128 * 64);
    }

    #[test]
    fn max_window_covers_both_classes() {
        let args = ExporterArgs::parse_from([
            "exporter",
            "--xid-count-window-size",
            "100",
            "--clock-events-count-window-size",
            "250",
        ]);
        let config = Config::from(&args);
        assert_eq!(config.max_window_size(), 250);
    }
}
