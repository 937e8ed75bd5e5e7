use super::propagation::{
    plan_clusters, propagate, ClusterAction, Propagation, PropagationOutcome,
};
use super::target::{RbacFleet, TrackerFleet};
use crate::backoff::Backoff;
use crate::context::{drain, error_policy, observe, Context};
use crate::errors::{
    from_finalizer_error, ErrorKind, ObjectId, ReconcileContext, ReconcileError, ReconcileResult,
};
use crate::k8s::patch_status;
use anyhow::anyhow;
use greenhouse_apis::well_known::FINALIZER_PROPAGATED_RESOURCE;
use greenhouse_apis::{
    Cluster, Condition, ConditionType, Team, TeamRole, TeamRoleBinding, TeamRoleBindingStatus,
};
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, Controller};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const CONTROLLER: &str = "teamRoleBinding";

struct TeamRbac {
    ctx: Context,
    backoff: Backoff,
    fleet: Arc<dyn RbacFleet>,
}

fn bindings_where(
    store: &Store<TeamRoleBinding>,
    namespace: Option<String>,
    filter: impl Fn(&TeamRoleBinding) -> bool,
) -> Vec<ObjectRef<TeamRoleBinding>> {
    store
        .state()
        .into_iter()
        .filter(|binding| binding.namespace() == namespace)
        .filter(|binding| filter(binding))
        .map(|binding| ObjectRef::from_obj(binding.as_ref()))
        .collect()
}

/// Materializes TeamRoleBindings as Roles and RoleBindings on remote clusters.
pub async fn run(ctx: Context) -> anyhow::Result<()> {
    info!("Starting team role binding controller");
    let client = ctx.client.clone();
    let controller = Controller::new(
        Api::<TeamRoleBinding>::all(client.clone()),
        watcher::Config::default(),
    );
    let store = controller.store();

    let controller = controller
        .watches(Api::<Team>::all(client.clone()), watcher::Config::default(), {
            let store = store.clone();
            move |team: Team| {
                let name = team.name_any();
                bindings_where(&store, team.namespace(), |binding| {
                    binding.spec.team_ref == name
                })
            }
        })
        .watches(Api::<TeamRole>::all(client.clone()), watcher::Config::default(), {
            let store = store.clone();
            move |team_role: TeamRole| {
                let name = team_role.name_any();
                bindings_where(&store, team_role.namespace(), |binding| {
                    binding.spec.team_role_ref == name
                })
            }
        })
        .watches(Api::<Cluster>::all(client), watcher::Config::default(), {
            let store = store.clone();
            move |cluster: Cluster| bindings_where(&store, cluster.namespace(), |_| true)
        })
        .with_config(ctx.controller_config())
        .run(
            reconcile,
            |binding, err, state| error_policy(CONTROLLER, &state.backoff, binding.as_ref(), err),
            Arc::new(TeamRbac {
                fleet: Arc::new(TrackerFleet::new(
                    ctx.client.clone(),
                    ctx.tracker.clone(),
                    ctx.remote_timeout(),
                )),
                backoff: ctx.backoff(),
                ctx,
            }),
        );
    drain(CONTROLLER, controller).await;
    Ok(())
}

async fn reconcile(
    binding: Arc<TeamRoleBinding>,
    state: Arc<TeamRbac>,
) -> ReconcileResult<Action> {
    let object = ObjectId::of(binding.as_ref());
    let namespace = binding.namespace().unwrap_or_default();
    let api = Api::<TeamRoleBinding>::namespaced(state.ctx.client.clone(), &namespace);
    let state = state.as_ref();
    observe(CONTROLLER, &state.backoff, &object, async {
        let (api, object) = (&api, &object);
        finalizer(
            api,
            FINALIZER_PROPAGATED_RESOURCE,
            binding.clone(),
            |event| async move {
                match event {
                    Event::Apply(binding) => materialize(api, &binding, state, object).await,
                    Event::Cleanup(binding) => release(api, &binding, state, object).await,
                }
            },
        )
        .await
        .map_err(|err| from_finalizer_error(object.clone(), err))
    })
    .await
}

async fn list_clusters(ctx: &Context, namespace: &str) -> Result<Vec<Cluster>, kube::Error> {
    Ok(Api::<Cluster>::namespaced(ctx.client.clone(), namespace)
        .list(&ListParams::default())
        .await?
        .items)
}

fn rbac_ready(outcome: &PropagationOutcome) -> Condition {
    if outcome.is_complete() {
        return Condition::new(ConditionType::RbacReady, true);
    }
    let clusters: Vec<&str> = outcome.failures.keys().map(String::as_str).collect();
    Condition::new(ConditionType::RbacReady, false)
        .with_reason("PropagationFailed")
        .with_message(format!("failed on clusters {}", clusters.join(", ")))
}

async fn write_status(
    api: &Api<TeamRoleBinding>,
    binding: &TeamRoleBinding,
    status: &TeamRoleBindingStatus,
    object: &ObjectId,
) -> ReconcileResult<()> {
    if binding.status.as_ref() == Some(status) {
        return Ok(());
    }
    patch_status(api, &binding.name_any(), status)
        .await
        .transient(object, "update team role binding status")?;
    Ok(())
}

fn incomplete(outcome: &PropagationOutcome, object: &ObjectId, operation: &'static str) -> ReconcileError {
    ReconcileError::new(
        ErrorKind::Transient,
        object.clone(),
        operation,
        anyhow!(
            "{} clusters failed: {}",
            outcome.failures.len(),
            outcome
                .failures
                .iter()
                .map(|(cluster, err)| format!("{cluster}: {err}"))
                .collect::<Vec<_>>()
                .join("; ")
        ),
    )
}

#[tracing::instrument(skip_all, fields(%object))]
async fn materialize(
    api: &Api<TeamRoleBinding>,
    binding: &TeamRoleBinding,
    state: &TeamRbac,
    object: &ObjectId,
) -> ReconcileResult<Action> {
    let mut status = binding.status.clone().unwrap_or_default();
    match load_inputs(binding, state, object).await {
        Ok((team_role, team, plan)) => {
            let propagation = Propagation {
                binding,
                team_role: &team_role,
                team: &team,
            };
            let outcome = propagate(
                state.fleet.as_ref(),
                &propagation,
                &plan,
                state.ctx.remote_timeout(),
            )
            .await;
            status.status_conditions.set(rbac_ready(&outcome));
            status.propagation_status = outcome.status.clone();
            write_status(api, binding, &status, object).await?;
            if !outcome.is_complete() {
                return Err(incomplete(&outcome, object, "propagate role bindings"));
            }
            Ok(Action::await_change())
        }
        Err(err) => {
            status.status_conditions.set(
                Condition::new(ConditionType::RbacReady, false)
                    .with_reason(err.kind.reason())
                    .with_message(err.status_message()),
            );
            write_status(api, binding, &status, object).await?;
            Err(err)
        }
    }
}

fn check_namespaces(binding: &TeamRoleBinding, object: &ObjectId) -> ReconcileResult<()> {
    if binding.spec.namespaces.iter().all(|namespace| namespace.is_empty()) {
        return Err(ReconcileError::new(
            ErrorKind::Configuration,
            object.clone(),
            "validate namespaces",
            anyhow!("missing namespace"),
        ));
    }
    Ok(())
}

async fn load_inputs(
    binding: &TeamRoleBinding,
    state: &TeamRbac,
    object: &ObjectId,
) -> ReconcileResult<(TeamRole, Team, BTreeMap<String, ClusterAction>)> {
    check_namespaces(binding, object)?;
    let ctx = &state.ctx;
    let namespace = binding.namespace().unwrap_or_default();

    let team_role = Api::<TeamRole>::namespaced(ctx.client.clone(), &namespace)
        .get_opt(&binding.spec.team_role_ref)
        .await
        .transient(object, "get team role")?
        .ok_or_else(|| {
            ReconcileError::new(
                ErrorKind::Configuration,
                object.clone(),
                "get team role",
                anyhow!("team role {} not found", binding.spec.team_role_ref),
            )
        })?;
    let team = Api::<Team>::namespaced(ctx.client.clone(), &namespace)
        .get_opt(&binding.spec.team_ref)
        .await
        .transient(object, "get team")?
        .ok_or_else(|| {
            ReconcileError::new(
                ErrorKind::Configuration,
                object.clone(),
                "get team",
                anyhow!("team {} not found", binding.spec.team_ref),
            )
        })?;
    let clusters = list_clusters(ctx, &namespace)
        .await
        .transient(object, "list clusters")?;
    let plan = plan_clusters(binding, &clusters, false).reconcile_err(
        ErrorKind::Configuration,
        object,
        "select clusters",
    )?;
    Ok((team_role, team, plan))
}

/// Removes every materialized RoleBinding before the TeamRoleBinding goes.
#[tracing::instrument(skip_all, fields(%object))]
async fn release(
    api: &Api<TeamRoleBinding>,
    binding: &TeamRoleBinding,
    state: &TeamRbac,
    object: &ObjectId,
) -> ReconcileResult<Action> {
    let namespace = binding.namespace().unwrap_or_default();
    let clusters = list_clusters(&state.ctx, &namespace)
        .await
        .transient(object, "list clusters")?;
    let plan = plan_clusters(binding, &clusters, true).reconcile_err(
        ErrorKind::Configuration,
        object,
        "select clusters",
    )?;
    // Only retractions are planned, the role and team are never read.
    let team_role = TeamRole::new(&binding.spec.team_role_ref, Default::default());
    let team = Team::new(&binding.spec.team_ref, Default::default());
    let propagation = Propagation {
        binding,
        team_role: &team_role,
        team: &team,
    };
    let outcome = propagate(
        state.fleet.as_ref(),
        &propagation,
        &plan,
        state.ctx.remote_timeout(),
    )
    .await;

    if !outcome.status.is_empty() {
        let mut status = binding.status.clone().unwrap_or_default();
        status.propagation_status = outcome.status.clone();
        status.status_conditions.set(rbac_ready(&outcome));
        write_status(api, binding, &status, object).await?;
        if outcome.is_complete() {
            return Err(ReconcileError::new(
                ErrorKind::Transient,
                object.clone(),
                "release role bindings",
                anyhow!("waiting for unreachable clusters to remove role bindings"),
            ));
        }
        return Err(incomplete(&outcome, object, "release role bindings"));
    }
    info!("role bindings released");
    Ok(Action::await_change())
}
