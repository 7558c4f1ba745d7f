//! Field identifiers, the static classification catalog, and the
//! grouping limits of the monitoring runtime.

pub mod group_resolver;

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

/// Numeric field identifier, matching the monitoring runtime's field-id
/// space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u16);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a field needs the device-side profiling (DCP) subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    Standard,
    Profiling,
}

impl FieldId {
    /// Classifies the field. Known fields use the catalog entry; unknown
    /// ids fall back to the id-space convention that the profiling range
    /// starts at [`catalog::FIRST_PROFILING_ID`].
    pub fn class(self) -> FieldClass {
        if let Some(meta) = FIELD_CATALOG.get(&self) {
            return meta.class;
        }
        if self.0 >= catalog::FIRST_PROFILING_ID {
            FieldClass::Profiling
        } else {
            FieldClass::Standard
        }
    }

    pub fn name(self) -> Option<&'static str> {
        FIELD_CATALOG.get(&self).map(|meta| meta.name)
    }
}

/// Catalog entry for a well-known field.
#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub class: FieldClass,
}

/// Well-known field identifiers.
pub mod catalog {
    use super::FieldId;

    /// First id of the profiling (DCP) field range.
    pub const FIRST_PROFILING_ID: u16 = 1000;

    pub const DEV_SM_CLOCK: FieldId = FieldId(100);
    pub const DEV_MEM_CLOCK: FieldId = FieldId(101);
    pub const DEV_CLOCK_THROTTLE_REASONS: FieldId = FieldId(112);
    pub const DEV_GPU_TEMP: FieldId = FieldId(150);
    pub const DEV_POWER_USAGE: FieldId = FieldId(155);
    pub const DEV_GPU_UTIL: FieldId = FieldId(203);
    pub const DEV_MEM_COPY_UTIL: FieldId = FieldId(204);
    pub const DEV_XID_ERRORS: FieldId = FieldId(230);
    pub const DEV_FB_FREE: FieldId = FieldId(251);
    pub const DEV_FB_USED: FieldId = FieldId(252);

    pub const PROF_GR_ENGINE_ACTIVE: FieldId = FieldId(1001);
    pub const PROF_SM_ACTIVE: FieldId = FieldId(1002);
    pub const PROF_SM_OCCUPANCY: FieldId = FieldId(1003);
    pub const PROF_PIPE_TENSOR_ACTIVE: FieldId = FieldId(1004);
    pub const PROF_DRAM_ACTIVE: FieldId = FieldId(1005);
    pub const PROF_PCIE_TX_BYTES: FieldId = FieldId(1009);
    pub const PROF_PCIE_RX_BYTES: FieldId = FieldId(1010);
    pub const PROF_NVLINK_TX_BYTES: FieldId = FieldId(1011);
    pub const PROF_NVLINK_RX_BYTES: FieldId = FieldId(1012);
}

static FIELD_CATALOG: Lazy<HashMap<FieldId, FieldMeta>> = Lazy::new(|| {
    use catalog::*;
    use FieldClass::*;

    let entries = [
        (DEV_SM_CLOCK, "sm_clock", Standard),
        (DEV_MEM_CLOCK, "mem_clock", Standard),
        (DEV_CLOCK_THROTTLE_REASONS, "clock_throttle_reasons", Standard),
        (DEV_GPU_TEMP, "gpu_temp", Standard),
        (DEV_POWER_USAGE, "power_usage", Standard),
        (DEV_GPU_UTIL, "gpu_util", Standard),
        (DEV_MEM_COPY_UTIL, "mem_copy_util", Standard),
        (DEV_XID_ERRORS, "xid_errors", Standard),
        (DEV_FB_FREE, "fb_free", Standard),
        (DEV_FB_USED, "fb_used", Standard),
        (PROF_GR_ENGINE_ACTIVE, "gr_engine_active", Profiling),
        (PROF_SM_ACTIVE, "sm_active", Profiling),
        (PROF_SM_OCCUPANCY, "sm_occupancy", Profiling),
        (PROF_PIPE_TENSOR_ACTIVE, "pipe_tensor_active", Profiling),
        (PROF_DRAM_ACTIVE, "dram_active", Profiling),
        (PROF_PCIE_TX_BYTES, "pcie_tx_bytes", Profiling),
        (PROF_PCIE_RX_BYTES, "pcie_rx_bytes", Profiling),
        (PROF_NVLINK_TX_BYTES, "nvlink_tx_bytes", Profiling),
        (PROF_NVLINK_RX_BYTES, "nvlink_rx_bytes", Profiling),
    ];

    entries
        .into_iter()
        .map(|(id, name, class)| (id, FieldMeta { name, class }))
        .collect()
});

/// Grouping constraints of the monitoring runtime.
#[derive(Debug, Clone, Copy)]
pub struct SubsystemLimits {
    /// Maximum fields that can be sampled together in one group.
    pub max_fields_per_group: usize,
    /// Maximum concurrent groups per device.
    pub max_groups: usize,
}

impl Default for SubsystemLimits {
    fn default() -> Self {
        Self {
            max_fields_per_group: 128,
            max_groups: 64,
        }
    }
}

impl SubsystemLimits {
    pub fn capacity(&self) -> usize {
        self.max_fields_per_group * self.max_groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_fields_classify_from_catalog() {
        assert_eq!(catalog::DEV_GPU_UTIL.class(), FieldClass::Standard);
        assert_eq!(catalog::PROF_SM_ACTIVE.class(), FieldClass::Profiling);
        assert_eq!(catalog::DEV_XID_ERRORS.name(), Some("xid_errors"));
    }

    #[test]
    fn unknown_fields_classify_by_id_range() {
        assert_eq!(FieldId(999).class(), FieldClass::Standard);
        assert_eq!(FieldId(1099).class(), FieldClass::Profiling);
        assert_eq!(FieldId(1099).name(), None);
    }
}
