//! Scaling and rolling-upgrade planning
//!
//! Planning is a pure function of the desired size and version and the
//! machines observed in this pass. Nothing is carried over between passes,
//! so a crash between two steps simply re-plans from what is observed.
//!
//! Membership is the set of joined machines. A machine that never joined
//! holds no consensus vote and can always be removed. Removing a joined
//! machine is allowed only when healthy membership is at quorum both before
//! and after the removal.

use std::cmp::Ordering;

use trellis_common::Error;

use crate::machines::ObservedMachine;

/// Healthy members needed for a membership of `members`: ⌈(N+1)/2⌉
pub fn quorum(members: usize) -> usize {
    if members == 0 {
        0
    } else {
        members / 2 + 1
    }
}

/// Next step toward the desired state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScalingAction {
    /// Size and version match; nothing to do
    Converged,
    /// Create this many machines at the desired version, concurrently
    Create(usize),
    /// Delete this machine
    Delete(String),
    /// A deletion is still in progress
    WaitForDeletion(String),
    /// Up-to-date machines are not healthy yet
    WaitForHealthy(Vec<String>),
}

/// Removal preference: never-joined first, then oldest, then by name
pub fn removal_order(a: &ObservedMachine, b: &ObservedMachine) -> Ordering {
    a.is_joined()
        .cmp(&b.is_joined())
        .then_with(|| match (&a.created, &b.created) {
            (Some(x), Some(y)) => x.cmp(y),
            // Unknown creation time sorts last
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.name.cmp(&b.name))
}

/// Check that removing `candidate` keeps healthy membership at quorum
pub fn check_removal(
    control_plane: &str,
    machines: &[ObservedMachine],
    candidate: &ObservedMachine,
) -> Result<(), Error> {
    if !candidate.is_joined() {
        return Ok(());
    }
    let members = machines.iter().filter(|m| m.is_joined()).count();
    let healthy = machines.iter().filter(|m| m.is_healthy()).count();
    let healthy_after = healthy - usize::from(candidate.is_healthy());
    let required_before = quorum(members);
    let required_after = quorum(members.saturating_sub(1));

    if healthy < required_before {
        return Err(Error::quorum_violation(
            control_plane,
            &candidate.name,
            healthy_after,
            required_before,
        ));
    }
    if healthy_after < required_after {
        return Err(Error::quorum_violation(
            control_plane,
            &candidate.name,
            healthy_after,
            required_after,
        ));
    }
    Ok(())
}

/// Plan one step for a control plane
///
/// At most one machine is deleted per pass, and only after every earlier
/// deletion has been observed to complete.
pub fn plan(
    control_plane: &str,
    desired: usize,
    version: &str,
    machines: &[ObservedMachine],
) -> Result<ScalingAction, Error> {
    if let Some(deleting) = machines.iter().find(|m| m.deleting) {
        return Ok(ScalingAction::WaitForDeletion(deleting.name.clone()));
    }

    let stale: Vec<&ObservedMachine> = machines
        .iter()
        .filter(|m| !m.is_up_to_date(version))
        .collect();

    // While rolling, no surge or removal until every replacement is healthy
    if !stale.is_empty() && desired <= machines.len() {
        let unhealthy: Vec<String> = machines
            .iter()
            .filter(|m| m.is_up_to_date(version) && !m.is_healthy())
            .map(|m| m.name.clone())
            .collect();
        if !unhealthy.is_empty() {
            return Ok(ScalingAction::WaitForHealthy(unhealthy));
        }
    }

    match desired.cmp(&machines.len()) {
        Ordering::Greater => Ok(ScalingAction::Create(desired - machines.len())),
        Ordering::Equal if stale.is_empty() => Ok(ScalingAction::Converged),
        // One replacement at a time; surplus is removed on a later pass
        Ordering::Equal => Ok(ScalingAction::Create(1)),
        Ordering::Less => {

            let candidates: Vec<&ObservedMachine> = if stale.is_empty() {
                machines.iter().collect()
            } else {
                stale
            };
            let Some(victim) = candidates.into_iter().min_by(|a, b| removal_order(a, b)) else {
                return Ok(ScalingAction::Converged);
            };
            check_removal(control_plane, machines, victim)?;
            Ok(ScalingAction::Delete(victim.name.clone()))
        }
    }
}
