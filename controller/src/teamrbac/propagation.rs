use super::target::{RbacFleet, RbacTarget};
use crate::context::with_timeout;
use greenhouse_apis::well_known::{rbac_name, LABEL_ROLE, LABEL_ROLE_BINDING};
use greenhouse_apis::{
    ApisError, Cluster, Condition, ConditionType, PropagationStatus, Team, TeamRole,
    TeamRoleBinding,
};
use itertools::Itertools;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use maplit::btreemap;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// What happens to the bindings of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAction {
    /// Materialize the Role and RoleBindings in every requested namespace.
    Apply,
    /// Delete every RoleBinding recorded for the cluster.
    Retract,
    /// Leave the recorded bindings as they are until the cluster is usable.
    Hold,
    /// Drop the record without touching the cluster.
    Forget,
}

/// Decides per cluster, from the current clusters and the recorded
/// propagation. Clusters neither targeted nor recorded do not appear.
///
/// Terminating clusters are never applied to. Their recorded bindings are
/// retracted while they are reachable and forgotten otherwise, so the cluster
/// finalizer is never blocked by an unreachable cluster.
pub fn plan_clusters(
    binding: &TeamRoleBinding,
    clusters: &[Cluster],
    deleting: bool,
) -> Result<BTreeMap<String, ClusterAction>, ApisError> {
    let recorded: BTreeSet<&str> = binding
        .propagated_clusters()
        .map(|propagated| propagated.cluster_name.as_str())
        .collect();
    let mut plan = BTreeMap::new();

    for cluster in clusters {
        let name = cluster.name_any();
        let was_recorded = recorded.contains(name.as_str());
        let targeted = !deleting && binding.targets(cluster)?;

        let action = if cluster.is_terminating() {
            match cluster.is_reachable() {
                true => ClusterAction::Retract,
                false => ClusterAction::Forget,
            }
        } else if targeted {
            match cluster.is_reachable() {
                true => ClusterAction::Apply,
                false => ClusterAction::Hold,
            }
        } else {
            match cluster.is_reachable() {
                true => ClusterAction::Retract,
                false => ClusterAction::Hold,
            }
        };

        if was_recorded || action == ClusterAction::Apply {
            plan.insert(name, action);
        }
    }

    for name in recorded {
        plan.entry(name.to_owned()).or_insert(ClusterAction::Forget);
    }
    Ok(plan)
}

/// The Role materialized for a TeamRole in one namespace.
pub fn desired_role(team_role: &TeamRole, namespace: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(rbac_name(&team_role.name_any())),
            namespace: Some(namespace.to_owned()),
            labels: Some(btreemap! {LABEL_ROLE.to_owned() => team_role.name_any()}),
            ..Default::default()
        },
        rules: Some(team_role.spec.rules.clone()),
    }
}

/// One User per member plus the mapped IdP group, sorted by kind and name.
pub fn team_subjects(team: &Team) -> Vec<Subject> {
    let users = team
        .spec
        .members
        .iter()
        .map(|member| ("User", member.id.clone()));
    let group = team
        .spec
        .mapped_idp_group
        .iter()
        .filter(|group| !group.is_empty())
        .map(|group| ("Group", group.clone()));

    users
        .chain(group)
        .sorted()
        .dedup()
        .map(|(kind, name)| Subject {
            api_group: Some(RBAC_API_GROUP.to_owned()),
            kind: kind.to_owned(),
            name,
            namespace: None,
        })
        .collect()
}

pub fn desired_role_binding(
    binding: &TeamRoleBinding,
    team_role: &TeamRole,
    team: &Team,
    namespace: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(rbac_name(&binding.name_any())),
            namespace: Some(namespace.to_owned()),
            labels: Some(btreemap! {LABEL_ROLE_BINDING.to_owned() => binding.name_any()}),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_owned(),
            kind: "Role".to_owned(),
            name: rbac_name(&team_role.name_any()),
        },
        subjects: Some(team_subjects(team)),
    }
}

fn labels_match(existing: &ObjectMeta, desired: &ObjectMeta) -> bool {
    let existing = existing.labels.clone().unwrap_or_default();
    desired
        .labels
        .iter()
        .flatten()
        .all(|(key, value)| existing.get(key) == Some(value))
}

/// Creates or updates the Role. Returns whether anything was written.
pub async fn ensure_role(target: &dyn RbacTarget, desired: &Role) -> Result<bool, kube::Error> {
    let namespace = desired.namespace().unwrap_or_default();
    let existing = target.get_role(&namespace, &desired.name_any()).await?;
    if let Some(existing) = existing {
        if existing.rules.clone().unwrap_or_default() == desired.rules.clone().unwrap_or_default()
            && labels_match(&existing.metadata, &desired.metadata)
        {
            return Ok(false);
        }
    }
    target.apply_role(desired).await?;
    Ok(true)
}

/// Creates or updates the RoleBinding. The role reference is immutable, so a
/// binding pointing at another role is replaced.
pub async fn ensure_role_binding(
    target: &dyn RbacTarget,
    desired: &RoleBinding,
) -> Result<bool, kube::Error> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    if let Some(existing) = target.get_role_binding(&namespace, &name).await? {
        if existing.role_ref != desired.role_ref {
            info!(%namespace, %name, "role reference changed, replacing role binding");
            target.delete_role_binding(&namespace, &name).await?;
        } else if existing.subjects.clone().unwrap_or_default()
            == desired.subjects.clone().unwrap_or_default()
            && labels_match(&existing.metadata, &desired.metadata)
        {
            return Ok(false);
        }
    }
    target.apply_role_binding(desired).await?;
    Ok(true)
}

/// Everything materialized for one TeamRoleBinding.
pub struct Propagation<'a> {
    pub binding: &'a TeamRoleBinding,
    pub team_role: &'a TeamRole,
    pub team: &'a Team,
}

#[derive(Debug, Default)]
pub struct PropagationOutcome {
    /// The new `propagationStatus`, sorted by cluster.
    pub status: Vec<PropagationStatus>,
    /// Clusters that could not be brought in line, with the cause.
    pub failures: BTreeMap<String, String>,
}

impl PropagationOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

fn recorded_namespaces(binding: &TeamRoleBinding, cluster: &str) -> BTreeSet<String> {
    binding
        .propagated_clusters()
        .filter(|propagated| propagated.cluster_name == cluster)
        .flat_map(|propagated| propagated.namespaces.iter().cloned())
        .collect()
}

fn previous_entry<'a>(binding: &'a TeamRoleBinding, cluster: &str) -> Option<&'a PropagationStatus> {
    binding
        .propagated_clusters()
        .find(|propagated| propagated.cluster_name == cluster)
}

/// Builds a status entry, keeping the transition time when the condition
/// status did not change.
fn entry(
    binding: &TeamRoleBinding,
    cluster: &str,
    namespaces: BTreeSet<String>,
    mut condition: Condition,
) -> PropagationStatus {
    if let Some(previous) = previous_entry(binding, cluster) {
        if previous.condition.status == condition.status {
            condition.last_transition_time = previous.condition.last_transition_time;
        }
    }
    PropagationStatus {
        cluster_name: cluster.to_owned(),
        namespaces: namespaces.into_iter().collect(),
        condition,
    }
}

async fn apply_cluster(
    fleet: &dyn RbacFleet,
    cluster: &str,
    propagation: &Propagation<'_>,
    namespaces: &BTreeSet<String>,
    stale: &BTreeSet<String>,
) -> anyhow::Result<usize> {
    let target = fleet
        .target(&propagation.binding.namespace().unwrap_or_default(), cluster)
        .await?;
    let target = target.as_ref();
    let mut writes = 0;
    for namespace in namespaces {
        if ensure_role(target, &desired_role(propagation.team_role, namespace)).await? {
            writes += 1;
        }
        let desired = desired_role_binding(
            propagation.binding,
            propagation.team_role,
            propagation.team,
            namespace,
        );
        if ensure_role_binding(target, &desired).await? {
            writes += 1;
        }
    }
    let name = rbac_name(&propagation.binding.name_any());
    for namespace in stale {
        info!(%namespace, "deleting role binding from namespace left behind");
        target.delete_role_binding(namespace, &name).await?;
        writes += 1;
    }
    Ok(writes)
}

async fn retract_cluster(
    fleet: &dyn RbacFleet,
    cluster: &str,
    binding: &TeamRoleBinding,
    namespaces: &BTreeSet<String>,
) -> anyhow::Result<()> {
    let target = fleet
        .target(&binding.namespace().unwrap_or_default(), cluster)
        .await?;
    let name = rbac_name(&binding.name_any());
    for namespace in namespaces {
        target.delete_role_binding(namespace, &name).await?;
    }
    Ok(())
}

/// Executes a cluster plan. Each cluster is handled independently; a failure
/// on one leaves its record in place and does not stop the others.
pub async fn propagate(
    fleet: &dyn RbacFleet,
    propagation: &Propagation<'_>,
    plan: &BTreeMap<String, ClusterAction>,
    timeout: Duration,
) -> PropagationOutcome {
    let binding = propagation.binding;
    let requested: BTreeSet<String> = binding
        .spec
        .namespaces
        .iter()
        .filter(|namespace| !namespace.is_empty())
        .cloned()
        .collect();
    let mut outcome = PropagationOutcome::default();

    for (cluster, action) in plan {
        let recorded = recorded_namespaces(binding, cluster);
        match action {
            ClusterAction::Apply => {
                let stale: BTreeSet<String> = recorded.difference(&requested).cloned().collect();
                let result = with_timeout(
                    timeout,
                    apply_cluster(fleet, cluster, propagation, &requested, &stale),
                )
                .await;
                match result {
                    Ok(writes) => {
                        debug!(%cluster, writes, "role bindings in place");
                        outcome.status.push(entry(
                            binding,
                            cluster,
                            requested.clone(),
                            Condition::new(ConditionType::RbacReady, true),
                        ));
                    }
                    Err(err) => {
                        warn!(%cluster, "failed propagating role binding: {err:#}");
                        outcome.status.push(entry(
                            binding,
                            cluster,
                            recorded.union(&requested).cloned().collect(),
                            Condition::new(ConditionType::RbacReady, false)
                                .with_reason("PropagationFailed")
                                .with_message(format!("{err:#}")),
                        ));
                        outcome.failures.insert(cluster.clone(), format!("{err:#}"));
                    }
                }
            }
            ClusterAction::Retract => {
                let result =
                    with_timeout(timeout, retract_cluster(fleet, cluster, binding, &recorded))
                        .await;
                match result {
                    Ok(()) => info!(%cluster, "role bindings removed from cluster"),
                    Err(err) => {
                        warn!(%cluster, "failed removing role binding: {err:#}");
                        outcome.status.push(entry(
                            binding,
                            cluster,
                            recorded,
                            Condition::new(ConditionType::RbacReady, false)
                                .with_reason("RetractionFailed")
                                .with_message(format!("{err:#}")),
                        ));
                        outcome.failures.insert(cluster.clone(), format!("{err:#}"));
                    }
                }
            }
            ClusterAction::Hold => {
                if let Some(previous) = previous_entry(binding, cluster) {
                    outcome.status.push(previous.clone());
                }
            }
            ClusterAction::Forget => debug!(%cluster, "forgetting role bindings of cluster"),
        }
    }
    outcome
}
