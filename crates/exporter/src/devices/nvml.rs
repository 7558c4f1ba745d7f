//! NVML-backed monitoring binding for the GPU domain.
//!
//! NvSwitch and CPU inventories are not reachable through NVML; this
//! binding reports them as empty and a configured Switch/CPU filter
//! will fail device selection on hosts where only this binding runs.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use nvml_wrapper::enum_wrappers::device::Clock;
use nvml_wrapper::enum_wrappers::device::PcieUtilCounter;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Device;
use nvml_wrapper::Nvml;
use tracing::info;
use tracing::warn;

use crate::devices::BindingError;
use crate::devices::DeviceDomain;
use crate::devices::DeviceEntry;
use crate::devices::FieldGroupHandle;
use crate::devices::FieldValue;
use crate::devices::MonitoringBinding;
use crate::fields::catalog;
use crate::fields::FieldId;

pub struct NvmlBinding {
    nvml: Arc<Nvml>,
    groups: Mutex<HashMap<u64, Vec<FieldId>>>,
    next_handle: AtomicU64,
}

impl NvmlBinding {
    pub fn init() -> Result<Self, BindingError> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(_) => {
                warn!("Standard NVML init failed, trying with explicit library path");
                Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .map_err(|e| BindingError::Unavailable(e.to_string()))?
            }
        };
        info!("NVML initialized successfully");
        Ok(Self {
            nvml: Arc::new(nvml),
            groups: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn device(&self, entry: &DeviceEntry) -> Result<Device<'_>, BindingError> {
        self.nvml
            .device_by_index(entry.major)
            .map_err(|e| BindingError::Runtime(e.to_string()))
    }

    fn read_field(device: &Device<'_>, field: FieldId) -> Result<Option<FieldValue>, NvmlError> {
        let value = match field {
            catalog::DEV_SM_CLOCK => FieldValue::Int(device.clock_info(Clock::SM)? as i64),
            catalog::DEV_MEM_CLOCK => FieldValue::Int(device.clock_info(Clock::Memory)? as i64),
            catalog::DEV_GPU_TEMP => {
                FieldValue::Int(device.temperature(TemperatureSensor::Gpu)? as i64)
            }
            catalog::DEV_POWER_USAGE => {
                FieldValue::Float(f64::from(device.power_usage()?) / 1000.0)
            }
            catalog::DEV_GPU_UTIL => FieldValue::Int(device.utilization_rates()?.gpu as i64),
            catalog::DEV_MEM_COPY_UTIL => {
                FieldValue::Int(device.utilization_rates()?.memory as i64)
            }
            catalog::DEV_FB_FREE => FieldValue::Int(device.memory_info()?.free as i64),
            catalog::DEV_FB_USED => FieldValue::Int(device.memory_info()?.used as i64),
            catalog::DEV_CLOCK_THROTTLE_REASONS => {
                FieldValue::Int(device.current_throttle_reasons()?.bits() as i64)
            }
            catalog::PROF_PCIE_TX_BYTES => {
                FieldValue::Int(device.pcie_throughput(PcieUtilCounter::Send)? as i64 * 1024)
            }
            catalog::PROF_PCIE_RX_BYTES => {
                FieldValue::Int(device.pcie_throughput(PcieUtilCounter::Receive)? as i64 * 1024)
            }
            // No NVML counterpart (XID counts and the remaining
            // profiling fields need the profiling runtime).
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

impl MonitoringBinding for NvmlBinding {
    fn enumerate(&self, domain: DeviceDomain) -> Result<Vec<DeviceEntry>, BindingError> {
        match domain {
            DeviceDomain::Gpu => {
                let count = self
                    .nvml
                    .device_count()
                    .map_err(|e| BindingError::Runtime(e.to_string()))?;
                Ok((0..count).map(DeviceEntry::major).collect())
            }
            DeviceDomain::Switch | DeviceDomain::Cpu => Ok(Vec::new()),
        }
    }

    fn device_id(
        &self,
        domain: DeviceDomain,
        entry: &DeviceEntry,
    ) -> Result<String, BindingError> {
        match domain {
            DeviceDomain::Gpu => {
                let device = self.device(entry)?;
                let uuid = device
                    .uuid()
                    .map_err(|e| BindingError::Runtime(e.to_string()))?;
                Ok(uuid.to_lowercase())
            }
            DeviceDomain::Switch | DeviceDomain::Cpu => Ok(format!("{domain}-{entry}")),
        }
    }

    fn create_field_group(&self, fields: &[FieldId]) -> Result<FieldGroupHandle, BindingError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.groups
            .lock()
            .expect("poisoned")
            .insert(handle, fields.to_vec());
        Ok(FieldGroupHandle(handle))
    }

    fn read_fields(
        &self,
        handle: FieldGroupHandle,
        domain: DeviceDomain,
        entry: &DeviceEntry,
    ) -> Result<HashMap<FieldId, FieldValue>, BindingError> {
        if domain != DeviceDomain::Gpu {
            return Ok(HashMap::new());
        }
        let fields = self
            .groups
            .lock()
            .expect("poisoned")
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| BindingError::Runtime(format!("unknown field group {}", handle.0)))?;

        let device = self.device(entry)?;
        let mut values = HashMap::new();
        for field in fields {
            match Self::read_field(&device, field) {
                // Fields the binding cannot serve are omitted, not errors.
                Ok(Some(value)) => {
                    values.insert(field, value);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(field = field.0, device = %entry, "Field read failed: {e}");
                }
            }
        }
        Ok(values)
    }
}
