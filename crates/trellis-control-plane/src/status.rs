//! ControlPlane status from observed machines

use std::cmp::Ordering;

use trellis_common::crd::ControlPlaneStatus;

use crate::machines::ObservedMachine;

/// Recompute replica counts and readiness from this pass's observation.
///
/// Conditions are left untouched; the controller sets them from the pass
/// outcome.
pub fn observed_status(
    machines: &[ObservedMachine],
    version: &str,
    selector: &str,
    generation: Option<i64>,
) -> ControlPlaneStatus {
    let replicas = count(machines.len());
    let ready_replicas = count(machines.iter().filter(|m| m.is_healthy()).count());
    let updated_replicas = count(machines.iter().filter(|m| m.is_up_to_date(version)).count());

    ControlPlaneStatus {
        replicas,
        ready_replicas,
        updated_replicas,
        unavailable_replicas: replicas - ready_replicas,
        initialized: machines.iter().any(|m| m.is_joined()),
        ready: ready_replicas > 0,
        version: lowest_version(machines.iter().filter(|m| m.is_joined())),
        selector: Some(selector.to_string()),
        observed_generation: generation,
        conditions: Vec::new(),
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Lowest version among the given machines
pub fn lowest_version<'a>(machines: impl Iterator<Item = &'a ObservedMachine>) -> Option<String> {
    machines
        .filter_map(|m| m.version.as_deref())
        .min_by(|a, b| compare_versions(a, b))
        .map(str::to_string)
}

/// Compare `vMAJOR.MINOR.PATCH[+build]` versions numerically
///
/// Falls back to string order when either side does not parse.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn parse_version(v: &str) -> Option<(u64, u64, u64)> {
    let core = v.trim_start_matches('v').split(['+', '-']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
    Some((parts.next()??, parts.next()??, parts.next().flatten().unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(name: &str, version: &str, joined: bool, ready: bool) -> ObservedMachine {
        ObservedMachine {
            name: name.to_string(),
            node_ref: joined.then(|| format!("node-{}", name)),
            version: Some(version.to_string()),
            created: None,
            ready,
            deleting: false,
        }
    }

    #[test]
    fn counts_follow_observation() {
        let machines = [
            machine("a", "v1.31.4+rke2r1", true, true),
            machine("b", "v1.32.1+rke2r1", true, true),
            machine("c", "v1.32.1+rke2r1", false, false),
        ];
        let status = observed_status(&machines, "v1.32.1+rke2r1", "sel", Some(4));

        assert_eq!(status.replicas, 3);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.updated_replicas, 2);
        assert_eq!(status.unavailable_replicas, 1);
        assert!(status.initialized);
        assert!(status.ready);
        assert_eq!(status.version.as_deref(), Some("v1.31.4+rke2r1"));
        assert_eq!(status.observed_generation, Some(4));
        assert!(!status.is_converged(3));
    }

    #[test]
    fn converged_when_all_desired_machines_are_ready_and_updated() {
        let machines = [
            machine("a", "v1.32.1+rke2r1", true, true),
            machine("b", "v1.32.1+rke2r1", true, true),
            machine("c", "v1.32.1+rke2r1", true, true),
        ];
        let status = observed_status(&machines, "v1.32.1+rke2r1", "sel", None);
        assert!(status.is_converged(3));
        assert!(!status.is_converged(2));
    }

    #[test]
    fn any_unavailable_replica_means_not_converged() {
        let machines = [
            machine("a", "v1.32.1+rke2r1", true, true),
            machine("b", "v1.32.1+rke2r1", true, false),
        ];
        let status = observed_status(&machines, "v1.32.1+rke2r1", "sel", None);
        assert_eq!(status.unavailable_replicas, 1);
        assert!(!status.is_converged(2));
    }

    #[test]
    fn empty_control_plane_is_neither_initialized_nor_ready() {
        let status = observed_status(&[], "v1.32.1+rke2r1", "sel", None);
        assert_eq!(status.replicas, 0);
        assert!(!status.initialized);
        assert!(!status.ready);
        assert_eq!(status.version, None);
        assert!(status.is_converged(0));
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("v1.9.0", "v1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("v1.31.4+rke2r2", "v1.31.4+rke2r1"), Ordering::Greater);
        assert_eq!(compare_versions("v1.31", "v1.31.0"), Ordering::Less);
    }
}
