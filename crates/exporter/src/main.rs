mod collector;
mod config;
mod counters;
mod devices;
mod fields;
mod hpc;
mod k8s;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use utils::version;

use crate::collector::Collector;
use crate::collector::CollectorSettings;
use crate::config::Config;
use crate::config::ExporterArgs;
use crate::counters::EventClass;
use crate::counters::WindowedEventCounter;
use crate::devices::nvml::NvmlBinding;
use crate::devices::selector;
use crate::devices::MonitoringBinding;
use crate::fields::group_resolver;
use crate::hpc::HpcJobMapper;
use crate::k8s::KubeClusterPodSource;
use crate::k8s::KubeletCheckpointSource;
use crate::k8s::PodMetadataCache;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let args = ExporterArgs::parse();
    let config = Config::from(&args);
    let _guard = logging::init(args.metrics_log_file.clone())?;

    info!("Starting GPU telemetry exporter {}", &**version::VERSION);

    let binding: Arc<dyn MonitoringBinding> =
        Arc::new(NvmlBinding::init().context("initializing the monitoring runtime")?);

    let devices =
        selector::resolve_all(&config, binding.as_ref()).context("resolving device filters")?;
    for (domain, entries) in &devices {
        if !entries.is_empty() {
            info!(domain = %domain, devices = entries.len(), "Monitoring devices");
        }
    }

    let groups = group_resolver::resolve(&config.fields, config.collect_dcp, &config.limits)
        .context("resolving field groups")?;
    if groups.is_degraded() {
        warn!(
            dropped = ?groups.dropped_profiling,
            "Profiling fields dropped: profiling collection is disabled"
        );
    }
    info!(
        fields = groups.field_count(),
        groups = groups.groups.len(),
        "Resolved field groups"
    );

    let counters = Arc::new(WindowedEventCounter::new(config.max_window_size()));
    let cancellation_token = CancellationToken::new();
    let mut tasks = Vec::new();

    let pod_cache = if config.kubernetes {
        let cluster = KubeClusterPodSource::connect(
            config.kubeconfig.as_deref(),
            config.node_name.clone(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("connecting to the Kubernetes API: {e:?}"))?;
        let resources = Arc::new(KubeletCheckpointSource::new(
            config.kubelet_device_state_path.clone(),
            config.nvidia_resource_names.clone(),
        ));
        let cache = Arc::new(PodMetadataCache::new(
            resources,
            Arc::new(cluster),
            config.pod_cache.clone(),
        ));
        tasks.push(tokio::spawn({
            let cache = cache.clone();
            let token = cancellation_token.clone();
            async move { cache.run(token).await }
        }));
        Some(cache)
    } else {
        None
    };

    let hpc_jobs = config.hpc_job_mapping_dir.clone().map(|dir| {
        let mapper = Arc::new(HpcJobMapper::new(dir));
        tasks.push(tokio::spawn({
            let mapper = mapper.clone();
            let token = cancellation_token.clone();
            let interval = config.collect_interval;
            async move { mapper.run(interval, token).await }
        }));
        mapper
    });

    let collector = Arc::new(
        Collector::new(
            binding,
            devices,
            &groups,
            counters,
            pod_cache,
            hpc_jobs,
            CollectorSettings {
                node_name: config.node_name.clone(),
                metrics_format: config.metrics_format.clone(),
                gpu_id_type: config.kubernetes_gpu_id_type,
                xid_count_window: config.window_size(EventClass::Xid),
                clock_events_count_window: config.window_size(EventClass::ClockThrottle),
            },
        )
        .context("registering field groups")?,
    );
    tasks.push(tokio::spawn({
        let collector = collector.clone();
        let token = cancellation_token.clone();
        let interval = config.collect_interval;
        async move { collector.run(interval, token).await }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("Shutdown signal received");
    cancellation_token.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Exporter stopped");

    Ok(())
}
