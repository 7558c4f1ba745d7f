//! Resolves user-declared device filters into concrete device sets.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::devices::DeviceDomain;
use crate::devices::DeviceEntry;
use crate::devices::DeviceOptions;
use crate::devices::MonitoringBinding;
use crate::devices::ResolvedDeviceSet;

/// Raised when an explicitly configured domain matches nothing on the
/// host. Fatal at startup (almost always an index typo); later cycles
/// log it and treat the domain as empty instead.
#[derive(Debug, Error)]
pub enum DeviceSelectionError {
    #[error(
        "{domain} device filter matched no devices \
         (major range {major_range:?}, minor range {minor_range:?})"
    )]
    EmptySelection {
        domain: DeviceDomain,
        major_range: Vec<i32>,
        minor_range: Vec<i32>,
    },

    #[error("failed to enumerate {domain} devices: {message}")]
    EnumerationFailed { domain: DeviceDomain, message: String },
}

/// Resolves one domain's filter against the live inventory.
///
/// `options == None` means the domain was never requested and resolves
/// to an empty set without error. Flex mode returns the live inventory
/// verbatim. Range mode crosses the listed indices (with `-1` meaning
/// "all at that position"), silently dropping indices the host does not
/// have, and yields an ascending deduplicated set.
pub fn resolve(
    domain: DeviceDomain,
    options: Option<&DeviceOptions>,
    live: &[DeviceEntry],
) -> Result<Vec<DeviceEntry>, DeviceSelectionError> {
    let Some(options) = options else {
        return Ok(Vec::new());
    };

    if options.flex {
        return Ok(live.to_vec());
    }

    let all_majors = options.major_range.contains(&-1);
    let majors: BTreeSet<u32> = options
        .major_range
        .iter()
        .filter(|idx| **idx >= 0)
        .map(|idx| *idx as u32)
        .collect();
    let all_minors = options.minor_range.contains(&-1);
    let minors: BTreeSet<u32> = options
        .minor_range
        .iter()
        .filter(|idx| **idx >= 0)
        .map(|idx| *idx as u32)
        .collect();

    let mut selected: BTreeSet<DeviceEntry> = BTreeSet::new();
    for entry in live {
        if !all_majors && !majors.contains(&entry.major) {
            continue;
        }
        match entry.minor {
            // The device has no minor concept; the minor range does not
            // apply to it.
            None => {
                selected.insert(*entry);
            }
            Some(minor) => {
                if all_minors || minors.contains(&minor) {
                    selected.insert(*entry);
                }
            }
        }
    }

    if selected.is_empty() {
        return Err(DeviceSelectionError::EmptySelection {
            domain,
            major_range: options.major_range.clone(),
            minor_range: options.minor_range.clone(),
        });
    }

    Ok(selected.into_iter().collect())
}

/// Resolves every domain's filter against the binding's current
/// inventory. Enumeration failures for a domain that was never
/// requested degrade to an empty set.
pub fn resolve_all(
    config: &Config,
    binding: &dyn MonitoringBinding,
) -> Result<ResolvedDeviceSet, DeviceSelectionError> {
    let mut resolved = ResolvedDeviceSet::new();
    for domain in DeviceDomain::ALL {
        let options = config.device_options(domain);
        let live = match binding.enumerate(domain) {
            Ok(live) => live,
            Err(e) if options.is_none() => {
                debug!(domain = %domain, "Skipping enumeration of unconfigured domain: {e}");
                Vec::new()
            }
            Err(e) => {
                return Err(DeviceSelectionError::EnumerationFailed {
                    domain,
                    message: e.to_string(),
                })
            }
        };
        let entries = resolve(domain, options, &live)?;
        debug!(
            domain = %domain,
            selected = entries.len(),
            live = live.len(),
            "Resolved device filter"
        );
        resolved.insert(domain, entries);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mig_inventory() -> Vec<DeviceEntry> {
        vec![
            DeviceEntry::pair(0, 0),
            DeviceEntry::pair(0, 1),
            DeviceEntry::major(1),
            DeviceEntry::pair(2, 0),
        ]
    }

    fn options(flex: bool, major: &[i32], minor: &[i32]) -> DeviceOptions {
        DeviceOptions {
            flex,
            major_range: major.to_vec(),
            minor_range: minor.to_vec(),
        }
    }

    #[test]
    fn unrequested_domain_resolves_empty_without_error() {
        let resolved = resolve(DeviceDomain::Cpu, None, &mig_inventory()).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn flex_returns_live_inventory_regardless_of_ranges() {
        let live = mig_inventory();
        let opts = options(true, &[7, 9], &[42]);
        let resolved = resolve(DeviceDomain::Gpu, Some(&opts), &live).unwrap();
        assert_eq!(resolved, live, "flex must track the live inventory");
    }

    #[test]
    fn flex_with_empty_inventory_is_empty_not_an_error() {
        let opts = options(true, &[], &[]);
        let resolved = resolve(DeviceDomain::Switch, Some(&opts), &[]).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn wildcard_ranges_equal_full_enumeration() {
        let live = mig_inventory();
        let opts = options(false, &[-1], &[-1]);
        let resolved = resolve(DeviceDomain::Gpu, Some(&opts), &live).unwrap();
        let mut full = live.clone();
        full.sort();
        assert_eq!(resolved, full);
    }

    #[test]
    fn explicit_ranges_cross_and_clip_to_inventory() {
        let live = mig_inventory();
        // Major 5 does not exist and must be dropped silently; minor 1
        // only exists under major 0.
        let opts = options(false, &[0, 2, 5], &[1]);
        let resolved = resolve(DeviceDomain::Gpu, Some(&opts), &live).unwrap();
        assert_eq!(resolved, vec![DeviceEntry::pair(0, 1)]);
    }

    #[test]
    fn device_without_minor_concept_ignores_minor_range() {
        let live = mig_inventory();
        let opts = options(false, &[1], &[0]);
        let resolved = resolve(DeviceDomain::Gpu, Some(&opts), &live).unwrap();
        assert_eq!(resolved, vec![DeviceEntry::major(1)]);
    }

    #[test]
    fn output_is_sorted_and_deduplicated() {
        let live = vec![
            DeviceEntry::pair(3, 1),
            DeviceEntry::pair(1, 0),
            DeviceEntry::pair(3, 0),
            DeviceEntry::pair(1, 0),
        ];
        let opts = options(false, &[3, 1, 3], &[-1]);
        let resolved = resolve(DeviceDomain::Gpu, Some(&opts), &live).unwrap();
        assert_eq!(
            resolved,
            vec![
                DeviceEntry::pair(1, 0),
                DeviceEntry::pair(3, 0),
                DeviceEntry::pair(3, 1),
            ]
        );
    }

    #[test]
    fn explicitly_requested_domain_with_no_match_errors() {
        let live = mig_inventory();
        let opts = options(false, &[9], &[-1]);
        let err = resolve(DeviceDomain::Gpu, Some(&opts), &live).unwrap_err();
        match err {
            DeviceSelectionError::EmptySelection { domain, .. } => {
                assert_eq!(domain, DeviceDomain::Gpu);
            }
            other => panic!("expected EmptySelection, got {other:?}"),
        }
    }
}
