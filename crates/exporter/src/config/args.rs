use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use utils::version;

use crate::devices::DeviceOptions;

/// How GPU devices are keyed when correlating with pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KubernetesGpuIdType {
    /// Correlate by GPU UUID (matches kubelet device IDs).
    Uid,
    /// Correlate by device name (`nvidia0`, `nvidia1`, ...).
    DeviceName,
}

/// Per-domain device filter as given on the command line.
#[derive(Debug, Clone)]
pub enum DeviceFilter {
    /// The domain is not monitored at all.
    NotRequested,
    Requested(DeviceOptions),
}

impl DeviceFilter {
    pub fn as_options(&self) -> Option<&DeviceOptions> {
        match self {
            DeviceFilter::NotRequested => None,
            DeviceFilter::Requested(options) => Some(options),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(about = "GPU telemetry exporter", version = &**version::VERSION)]
pub struct ExporterArgs {
    #[arg(
        long,
        env = "GPU_EXPORTER_FIELDS",
        value_delimiter = ',',
        default_value = "100,101,112,150,155,203,204,230,251,252",
        help = "Field ids to collect each cycle"
    )]
    pub fields: Vec<u16>,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Collect profiling (DCP) fields when the runtime supports them"
    )]
    pub collect_dcp: bool,

    #[arg(
        long,
        env = "GPU_EXPORTER_GPU_DEVICES",
        default_value = "f",
        value_parser = parse_device_filter,
        help = "GPU filter: 'f' (flex), 'all', 'none', 'majors[:minors]' (e.g. '0,2-4:-1') or JSON"
    )]
    pub gpu_devices: DeviceFilter,

    #[arg(
        long,
        env = "GPU_EXPORTER_SWITCH_DEVICES",
        default_value = "none",
        value_parser = parse_device_filter,
        help = "NvSwitch filter, same syntax as --gpu-devices"
    )]
    pub switch_devices: DeviceFilter,

    #[arg(
        long,
        env = "GPU_EXPORTER_CPU_DEVICES",
        default_value = "none",
        value_parser = parse_device_filter,
        help = "CPU filter, same syntax as --gpu-devices"
    )]
    pub cpu_devices: DeviceFilter,

    #[arg(
        long,
        default_value = "600",
        help = "Samples retained per device for windowed XID error counts"
    )]
    pub xid_count_window_size: usize,

    #[arg(
        long,
        default_value = "600",
        help = "Samples retained per device for windowed clock event counts"
    )]
    pub clock_events_count_window_size: usize,

    #[arg(long, default_value = "30000", help = "Collection interval in milliseconds")]
    pub collect_interval_ms: u64,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Enable Kubernetes pod correlation"
    )]
    pub kubernetes: bool,

    #[arg(
        long,
        value_enum,
        default_value_t = KubernetesGpuIdType::Uid,
        help = "Device identity used when correlating GPUs with pods"
    )]
    pub kubernetes_gpu_id_type: KubernetesGpuIdType,

    #[arg(long, env = "NODE_NAME", default_value = "", help = "Node this exporter runs on")]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "/var/lib/kubelet/device-plugins/kubelet_internal_checkpoint",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet device state path for fetching device-to-pod assignments"
    )]
    pub kubelet_device_state_path: PathBuf,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "nvidia.com/gpu",
        help = "Resource names treated as monitored devices"
    )]
    pub nvidia_resource_names: Vec<String>,

    #[arg(
        long,
        default_value = "30",
        help = "Pod metadata cache refresh interval in seconds"
    )]
    pub pod_cache_refresh_interval_secs: u64,

    #[arg(
        long,
        default_value = "10",
        help = "Upper bound in seconds on one pod metadata refresh"
    )]
    pub pod_cache_source_timeout_secs: u64,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Pod label keys allowed into exported metadata"
    )]
    pub inherit_pod_labels: Vec<String>,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Pod annotation keys allowed into exported metadata"
    )]
    pub inherit_pod_annotations: Vec<String>,

    #[arg(
        long,
        env = "HPC_JOB_MAPPING_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory with one file per GPU index listing HPC jobs on it"
    )]
    pub hpc_job_mapping_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "GPU_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for the rolling metrics log, e.g. /logs/metrics.log"
    )]
    pub metrics_log_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = "influx",
        help = "Output format for emitted samples: influx or json"
    )]
    pub metrics_format: String,

    #[arg(long, default_value = "128", help = "Runtime limit on fields per sampling group")]
    pub max_fields_per_group: usize,

    #[arg(long, default_value = "64", help = "Runtime limit on concurrent sampling groups")]
    pub max_field_groups: usize,
}

/// Parses a per-domain device filter.
///
/// Accepts `none`, `f`/`flex`, `all`, a `majors[:minors]` index-list
/// form where each list is comma-separated ints or `a-b` ranges with
/// `-1` meaning "all", or a JSON object for configuration sources that
/// pass options through structured (e.g. an operator-rendered env var).
pub fn parse_device_filter(s: &str) -> Result<DeviceFilter, String> {
    let trimmed = s.trim();
    match trimmed {
        "none" | "" => return Ok(DeviceFilter::NotRequested),
        "f" | "flex" => {
            return Ok(DeviceFilter::Requested(DeviceOptions {
                flex: true,
                major_range: Vec::new(),
                minor_range: Vec::new(),
            }))
        }
        "all" => {
            return Ok(DeviceFilter::Requested(DeviceOptions {
                flex: false,
                major_range: vec![-1],
                minor_range: vec![-1],
            }))
        }
        _ => {}
    }

    if trimmed.starts_with('{') {
        let options: DeviceOptions = serde_json::from_str(trimmed)
            .map_err(|e| format!("Failed to parse device options JSON: {e}"))?;
        return Ok(DeviceFilter::Requested(options));
    }

    let (majors, minors) = match trimmed.split_once(':') {
        Some((majors, minors)) => (parse_index_list(majors)?, parse_index_list(minors)?),
        None => (parse_index_list(trimmed)?, vec![-1]),
    };
    Ok(DeviceFilter::Requested(DeviceOptions {
        flex: false,
        major_range: majors,
        minor_range: minors,
    }))
}

/// Parses `0,2-4,-1` style index lists.
fn parse_index_list(s: &str) -> Result<Vec<i32>, String> {
    let mut indices = Vec::new();
    for token in s.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        // A range like "2-4"; a leading '-' is a negative sentinel, not
        // a range.
        if let Some((start, end)) = token.split_once('-').filter(|(start, _)| !start.is_empty()) {
            let start: i32 = start
                .parse()
                .map_err(|e| format!("Invalid index '{token}': {e}"))?;
            let end: i32 = end
                .parse()
                .map_err(|e| format!("Invalid index '{token}': {e}"))?;
            if start < 0 || end < start {
                return Err(format!("Invalid index range '{token}'"));
            }
            indices.extend(start..=end);
        } else {
            let index: i32 = token
                .parse()
                .map_err(|e| format!("Invalid index '{token}': {e}"))?;
            if index < -1 {
                return Err(format!("Invalid index '{token}'"));
            }
            indices.push(index);
        }
    }
    if indices.is_empty() {
        return Err("Empty index list".to_string());
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flex_all_and_none() {
        assert!(matches!(
            parse_device_filter("none").unwrap(),
            DeviceFilter::NotRequested
        ));
        match parse_device_filter("f").unwrap() {
            DeviceFilter::Requested(options) => assert!(options.flex),
            other => panic!("expected flex filter, got {other:?}"),
        }
        match parse_device_filter("all").unwrap() {
            DeviceFilter::Requested(options) => {
                assert!(!options.flex);
                assert_eq!(options.major_range, vec![-1]);
                assert_eq!(options.minor_range, vec![-1]);
            }
            other => panic!("expected wildcard filter, got {other:?}"),
        }
    }

    #[test]
    fn parses_index_lists_with_ranges_and_sentinels() {
        match parse_device_filter("0,2-4:1,-1").unwrap() {
            DeviceFilter::Requested(options) => {
                assert_eq!(options.major_range, vec![0, 2, 3, 4]);
                assert_eq!(options.minor_range, vec![1, -1]);
            }
            other => panic!("expected range filter, got {other:?}"),
        }
    }

    #[test]
    fn majors_only_form_defaults_minors_to_all() {
        match parse_device_filter("1,3").unwrap() {
            DeviceFilter::Requested(options) => {
                assert_eq!(options.major_range, vec![1, 3]);
                assert_eq!(options.minor_range, vec![-1]);
            }
            other => panic!("expected range filter, got {other:?}"),
        }
    }

    #[test]
    fn parses_json_device_options() {
        let json = r#"{"flex": false, "majorRange": [0, 1], "minorRange": [-1]}"#;
        match parse_device_filter(json).unwrap() {
            DeviceFilter::Requested(options) => {
                assert_eq!(options.major_range, vec![0, 1]);
                assert_eq!(options.minor_range, vec![-1]);
            }
            other => panic!("expected JSON filter, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_filters() {
        assert!(parse_device_filter("4-2").is_err());
        assert!(parse_device_filter("a,b").is_err());
        assert!(parse_device_filter("{bad json").is_err());
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = ExporterArgs::parse_from(["exporter"]);
        assert_eq!(args.fields.len(), 10);
        assert!(args.collect_dcp);
        assert!(!args.kubernetes);
        assert!(args.gpu_devices.as_options().is_some_and(|o| o.flex));
        assert!(args.cpu_devices.as_options().is_none());
        assert_eq!(args.xid_count_window_size, 600);
        assert_eq!(args.nvidia_resource_names, vec!["nvidia.com/gpu"]);
    }
}
