use chrono::prelude::*;
use greenhouse_apis::{Plugin, TeamRoleBinding};
use std::time::Duration;

/// What the deletion protocol asks for, given a Cluster's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionStep {
    /// Not marked, nothing scheduled.
    Idle,
    /// Marked without a schedule: write this one.
    Schedule(DateTime<Utc>),
    /// Marked and scheduled in the future.
    Wait(Duration),
    /// The schedule has passed.
    Delete,
    /// The mark was removed, drop the stale schedule.
    Unschedule,
}

pub fn deletion_step(
    now: DateTime<Utc>,
    marked: bool,
    schedule: Option<DateTime<Utc>>,
    grace_period: Duration,
) -> DeletionStep {
    match (marked, schedule) {
        (false, None) => DeletionStep::Idle,
        (false, Some(_)) => DeletionStep::Unschedule,
        (true, None) => {
            let grace_period =
                chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::MAX);
            DeletionStep::Schedule(now.checked_add_signed(grace_period).unwrap_or(now))
        }
        (true, Some(at)) => match (at - now).to_std() {
            Ok(remaining) if !remaining.is_zero() => DeletionStep::Wait(remaining),
            _ => DeletionStep::Delete,
        },
    }
}

/// Objects still holding on to a terminating cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dependents {
    /// Plugins whose release lives on the cluster.
    pub plugins: usize,
    /// TeamRoleBindings with RoleBindings recorded on the cluster.
    pub role_bindings: usize,
}

impl Dependents {
    pub fn of(cluster_name: &str, plugins: &[Plugin], bindings: &[TeamRoleBinding]) -> Self {
        Self {
            plugins: plugins
                .iter()
                .filter(|plugin| plugin.spec.cluster_name == cluster_name)
                .count(),
            role_bindings: bindings
                .iter()
                .filter(|binding| {
                    binding
                        .propagated_clusters()
                        .any(|propagated| propagated.cluster_name == cluster_name)
                })
                .count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins == 0 && self.role_bindings == 0
    }
}
