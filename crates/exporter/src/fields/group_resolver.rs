//! Maps the configured field set onto the runtime's grouping limits.
//!
//! Stateless and side-effect free; recomputed only when the configured
//! field set or collection mode changes.

use std::collections::HashSet;

use thiserror::Error;

use crate::fields::FieldClass;
use crate::fields::FieldId;
use crate::fields::SubsystemLimits;

/// One sampling group, within the runtime's fields-per-group limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGroupSpec {
    pub name: String,
    pub fields: Vec<FieldId>,
}

/// Result of group resolution. `dropped_profiling` carries the
/// degraded-mode condition: profiling fields excluded because the
/// runtime's profiling capability is off. The caller reports it once;
/// collection continues with the reduced set.
#[derive(Debug, Clone, Default)]
pub struct ResolvedGroups {
    pub groups: Vec<FieldGroupSpec>,
    pub dropped_profiling: Vec<FieldId>,
}

impl ResolvedGroups {
    pub fn is_degraded(&self) -> bool {
        !self.dropped_profiling.is_empty()
    }

    pub fn field_count(&self) -> usize {
        self.groups.iter().map(|group| group.fields.len()).sum()
    }
}

/// Raised when the configuration is fundamentally oversized for the
/// runtime. Fatal at startup; retrying cannot resolve it.
#[derive(Debug, Error)]
pub enum MetricGroupError {
    #[error(
        "{requested} configured fields exceed the runtime capacity of {capacity} \
         ({max_groups} groups x {max_fields_per_group} fields)"
    )]
    CapacityExceeded {
        requested: usize,
        capacity: usize,
        max_groups: usize,
        max_fields_per_group: usize,
    },
}

/// Partitions the requested fields into sampling groups.
///
/// Requested ids are deduplicated in input order. With `dcp_enabled`
/// false, profiling-class fields are dropped into
/// [`ResolvedGroups::dropped_profiling`] instead of being collected.
/// The surviving fields are packed greedily in input order; exact
/// optimal packing is not required since group count only affects
/// sampling overhead.
pub fn resolve(
    requested: &[FieldId],
    dcp_enabled: bool,
    limits: &SubsystemLimits,
) -> Result<ResolvedGroups, MetricGroupError> {
    let mut seen = HashSet::new();
    let mut fields = Vec::new();
    let mut dropped_profiling = Vec::new();

    for field in requested {
        if !seen.insert(*field) {
            continue;
        }
        match field.class() {
            FieldClass::Profiling if !dcp_enabled => dropped_profiling.push(*field),
            _ => fields.push(*field),
        }
    }

    if fields.len() > limits.capacity() {
        return Err(MetricGroupError::CapacityExceeded {
            requested: fields.len(),
            capacity: limits.capacity(),
            max_groups: limits.max_groups,
            max_fields_per_group: limits.max_fields_per_group,
        });
    }

    let groups = fields
        .chunks(limits.max_fields_per_group.max(1))
        .enumerate()
        .map(|(index, chunk)| FieldGroupSpec {
            name: format!("exporter-fields-{index}"),
            fields: chunk.to_vec(),
        })
        .collect();

    Ok(ResolvedGroups {
        groups,
        dropped_profiling,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::catalog;

    fn limits(per_group: usize, groups: usize) -> SubsystemLimits {
        SubsystemLimits {
            max_fields_per_group: per_group,
            max_groups: groups,
        }
    }

    #[test]
    fn no_group_exceeds_the_per_group_limit() {
        let requested: Vec<FieldId> = (100..110).map(FieldId).collect();
        let resolved = resolve(&requested, true, &limits(4, 8)).unwrap();
        assert_eq!(resolved.groups.len(), 3);
        assert!(resolved.groups.iter().all(|group| group.fields.len() <= 4));
        assert_eq!(resolved.field_count(), 10);
    }

    #[test]
    fn duplicates_are_removed_in_input_order() {
        let requested = vec![
            catalog::DEV_GPU_UTIL,
            catalog::DEV_GPU_TEMP,
            catalog::DEV_GPU_UTIL,
        ];
        let resolved = resolve(&requested, true, &SubsystemLimits::default()).unwrap();
        assert_eq!(
            resolved.groups[0].fields,
            vec![catalog::DEV_GPU_UTIL, catalog::DEV_GPU_TEMP]
        );
    }

    #[test]
    fn profiling_fields_drop_when_dcp_is_disabled() {
        let requested = vec![
            catalog::DEV_GPU_UTIL,
            catalog::PROF_SM_ACTIVE,
            catalog::PROF_DRAM_ACTIVE,
        ];
        let resolved = resolve(&requested, false, &SubsystemLimits::default()).unwrap();
        assert!(resolved.is_degraded());
        assert_eq!(
            resolved.dropped_profiling,
            vec![catalog::PROF_SM_ACTIVE, catalog::PROF_DRAM_ACTIVE]
        );
        // Collection continues with the standard subset.
        assert_eq!(resolved.groups[0].fields, vec![catalog::DEV_GPU_UTIL]);
    }

    #[test]
    fn profiling_fields_survive_when_dcp_is_enabled() {
        let requested = vec![catalog::DEV_GPU_UTIL, catalog::PROF_SM_ACTIVE];
        let resolved = resolve(&requested, true, &SubsystemLimits::default()).unwrap();
        assert!(!resolved.is_degraded());
        assert_eq!(resolved.field_count(), 2);
    }

    #[test]
    fn field_total_is_conserved_after_dedup_and_drop() {
        let requested = vec![
            catalog::DEV_GPU_UTIL,
            catalog::DEV_GPU_UTIL,
            catalog::DEV_FB_USED,
            catalog::PROF_SM_ACTIVE,
        ];
        let resolved = resolve(&requested, false, &limits(1, 8)).unwrap();
        // 4 requested - 1 duplicate - 1 dropped profiling = 2 collected.
        assert_eq!(resolved.field_count(), 2);
        assert_eq!(resolved.dropped_profiling.len(), 1);
    }

    #[test]
    fn oversized_standard_set_is_fatal() {
        let requested: Vec<FieldId> = (100..115).map(FieldId).collect();
        let err = resolve(&requested, false, &limits(2, 4)).unwrap_err();
        match err {
            MetricGroupError::CapacityExceeded {
                requested,
                capacity,
                ..
            } => {
                assert_eq!(requested, 15);
                assert_eq!(capacity, 8);
            }
        }
    }

    #[test]
    fn dropping_profiling_fields_can_bring_config_back_within_capacity() {
        let mut requested: Vec<FieldId> = (100..107).map(FieldId).collect();
        requested.extend((1001..1009).map(FieldId));
        // 15 fields total would exceed 2x4; the 8 profiling fields drop.
        let resolved = resolve(&requested, false, &limits(4, 2)).unwrap();
        assert_eq!(resolved.field_count(), 7);
        assert_eq!(resolved.dropped_profiling.len(), 8);
    }
}
