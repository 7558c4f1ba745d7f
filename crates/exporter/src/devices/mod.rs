//! Device domains, live inventory, and the monitoring-binding seam.
//!
//! The exporter watches three independent hardware domains (GPUs,
//! NvSwitches, CPUs). The actual monitoring runtime is reached only
//! through the [`MonitoringBinding`] trait so that device enumeration,
//! field-group creation and field reads stay opaque calls.

pub mod nvml;
pub mod selector;

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::fields::FieldId;

/// Hardware domains monitored independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceDomain {
    Gpu,
    Switch,
    Cpu,
}

impl DeviceDomain {
    pub const ALL: [DeviceDomain; 3] = [DeviceDomain::Gpu, DeviceDomain::Switch, DeviceDomain::Cpu];
}

impl fmt::Display for DeviceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDomain::Gpu => write!(f, "gpu"),
            DeviceDomain::Switch => write!(f, "switch"),
            DeviceDomain::Cpu => write!(f, "cpu"),
        }
    }
}

/// One enumerable device: a major index plus an optional minor index
/// (GPU instance, NvLink or CPU core). Devices without a minor concept
/// carry `None`.
///
/// Ordering is ascending `(major, minor)` with `None` sorting first,
/// which keeps resolved sets stable across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceEntry {
    pub major: u32,
    pub minor: Option<u32>,
}

impl DeviceEntry {
    pub fn major(major: u32) -> Self {
        Self { major, minor: None }
    }

    pub fn pair(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor: Some(minor),
        }
    }
}

impl fmt::Display for DeviceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}:{}", self.major, minor),
            None => write!(f, "{}", self.major),
        }
    }
}

/// User-declared device filter for one domain.
///
/// `-1` in a range position means "all values at that position". An
/// unset domain is represented as `Option<DeviceOptions>::None` in the
/// configuration, never as empty ranges: emptiness and "all" are
/// distinct configurations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceOptions {
    /// Track the live inventory instead of a fixed list, adapting
    /// automatically when devices are repartitioned (e.g. MIG toggled).
    pub flex: bool,
    pub major_range: Vec<i32>,
    pub minor_range: Vec<i32>,
}

/// Resolved device sets keyed by domain, ascending and deduplicated.
pub type ResolvedDeviceSet = HashMap<DeviceDomain, Vec<DeviceEntry>>;

/// Opaque handle to a field group created in the monitoring runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldGroupHandle(pub u64);

/// A sampled field value as reported by the monitoring runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_u64(self) -> u64 {
        match self {
            FieldValue::Int(v) => v.max(0) as u64,
            FieldValue::Float(v) => {
                if v.is_finite() && v > 0.0 {
                    v as u64
                } else {
                    0
                }
            }
        }
    }
}

/// Errors surfaced by the monitoring runtime.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("monitoring runtime unavailable: {0}")]
    Unavailable(String),
    #[error("monitoring runtime call failed: {0}")]
    Runtime(String),
}

/// The opaque monitoring-runtime calls consumed by the exporter core.
///
/// Implementations must not be called while holding any exporter lock;
/// the collection loop copies what it needs before crossing this seam.
pub trait MonitoringBinding: Send + Sync {
    /// Current enumerable devices for a domain, in ascending order.
    fn enumerate(&self, domain: DeviceDomain) -> Result<Vec<DeviceEntry>, BindingError>;

    /// Correlation identity for a device (GPU UUID for the GPU domain),
    /// matching the identities reported by the kubelet.
    fn device_id(
        &self,
        domain: DeviceDomain,
        entry: &DeviceEntry,
    ) -> Result<String, BindingError>;

    fn create_field_group(&self, fields: &[FieldId]) -> Result<FieldGroupHandle, BindingError>;

    fn read_fields(
        &self,
        handle: FieldGroupHandle,
        domain: DeviceDomain,
        entry: &DeviceEntry,
    ) -> Result<HashMap<FieldId, FieldValue>, BindingError>;
}
