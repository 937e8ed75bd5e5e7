use super::deletion::{deletion_step, DeletionStep, Dependents};
use super::probe::{connect, probed_status};
use crate::backoff::Backoff;
use crate::context::{drain, error_policy, observe, Context};
use crate::errors::{
    from_finalizer_error, ErrorKind, ObjectId, ReconcileContext, ReconcileError, ReconcileResult,
};
use crate::k8s::{patch_annotations, patch_status};
use anyhow::anyhow;
use chrono::prelude::*;
use greenhouse_apis::well_known::{
    ANNOTATION_DELETION_SCHEDULE, FINALIZER_CLUSTER_CLEANUP, SECRET_TYPE_KUBECONFIG,
};
use greenhouse_apis::{Cluster, ClusterSpec, Condition, ConditionType, Plugin, TeamRoleBinding};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Resource, ResourceExt};
use maplit::btreemap;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

const SECRET_CONTROLLER: &str = "bootstrap";
const CLUSTER_CONTROLLER: &str = "cluster";

struct Bootstrap {
    ctx: Context,
    backoff: Backoff,
}

/// Registers clusters from kubeconfig secrets and runs their deletion
/// protocol.
pub async fn run(ctx: Context) -> anyhow::Result<()> {
    info!("Starting cluster bootstrap controller");
    let client = ctx.client.clone();
    let secrets = Api::<Secret>::all(client.clone());
    let clusters = Api::<Cluster>::all(client.clone());

    let secret_controller = Controller::new(
        secrets,
        watcher::Config::default().fields(&format!("type={SECRET_TYPE_KUBECONFIG}")),
    )
    .with_config(ctx.controller_config())
    .run(
        reconcile_secret,
        |secret, err, state| error_policy(SECRET_CONTROLLER, &state.backoff, secret.as_ref(), err),
        Arc::new(Bootstrap {
            backoff: ctx.backoff(),
            ctx: ctx.clone(),
        }),
    );

    let cluster_controller = Controller::new(clusters, watcher::Config::default())
        .watches(
            Api::<Plugin>::all(client.clone()),
            watcher::Config::default(),
            |plugin: Plugin| {
                plugin
                    .namespace()
                    .map(|ns| ObjectRef::new(&plugin.spec.cluster_name).within(&ns))
            },
        )
        .watches(
            Api::<TeamRoleBinding>::all(client),
            watcher::Config::default(),
            |trb: TeamRoleBinding| {
                let namespace = trb.namespace().unwrap_or_default();
                trb.propagated_clusters()
                    .map(|propagated| {
                        ObjectRef::new(&propagated.cluster_name).within(&namespace)
                    })
                    .collect::<Vec<_>>()
            },
        )
        .with_config(ctx.controller_config())
        .run(
            reconcile_cluster,
            |cluster, err, state| {
                error_policy(CLUSTER_CONTROLLER, &state.backoff, cluster.as_ref(), err)
            },
            Arc::new(Bootstrap {
                backoff: ctx.backoff(),
                ctx,
            }),
        );

    futures::join!(
        drain(SECRET_CONTROLLER, secret_controller),
        drain(CLUSTER_CONTROLLER, cluster_controller),
    );
    Ok(())
}

async fn reconcile_secret(secret: Arc<Secret>, state: Arc<Bootstrap>) -> ReconcileResult<Action> {
    let object = ObjectId::of(secret.as_ref());
    observe(
        SECRET_CONTROLLER,
        &state.backoff,
        &object,
        bootstrap(&secret, &state.ctx, &object),
    )
    .await
}

#[tracing::instrument(skip_all, fields(%object))]
async fn bootstrap(secret: &Secret, ctx: &Context, object: &ObjectId) -> ReconcileResult<Action> {
    if secret.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let namespace = secret.namespace().unwrap_or_default();
    let name = secret.name_any();
    let clusters = Api::<Cluster>::namespaced(ctx.client.clone(), &namespace);

    let cluster = ensure_cluster(&clusters, &name)
        .await
        .transient(object, "ensure cluster")?;
    if cluster.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    ensure_owned(
        &Api::<Secret>::namespaced(ctx.client.clone(), &namespace),
        secret,
        &cluster,
    )
    .await
    .transient(object, "set secret owner")?;

    let outcome = connect(secret, &namespace, &name, ctx.remote_timeout()).await;
    let status = probed_status(cluster.status.as_ref(), &outcome);
    match outcome {
        Ok(probe) => {
            ctx.tracker.insert(probe.remote).await;
        }
        Err(err) => {
            warn!("cluster {namespace}/{name} is not usable: {err}");
            ctx.tracker.remove(&namespace, &name).await;
        }
    }

    if cluster.status.as_ref() != Some(&status) {
        info!(access_state = %status.access_state, "updating cluster status");
        patch_status(&clusters, &name, &status)
            .await
            .transient(object, "update cluster status")?;
    }
    Ok(Action::requeue(ctx.config.cluster.probe_interval.into()))
}

async fn ensure_cluster(api: &Api<Cluster>, name: &str) -> Result<Cluster, kube::Error> {
    if let Some(cluster) = api.get_opt(name).await? {
        return Ok(cluster);
    }
    info!("registering cluster {name}");
    api.create(
        &PostParams::default(),
        &Cluster::new(name, ClusterSpec::default()),
    )
    .await
}

/// Makes the secret go away with its cluster.
async fn ensure_owned(api: &Api<Secret>, secret: &Secret, cluster: &Cluster) -> anyhow::Result<()> {
    let owner = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| anyhow!("cluster has no uid yet"))?;
    let mut owners = secret.owner_references().to_vec();
    if owners.iter().any(|existing| existing.uid == owner.uid) {
        return Ok(());
    }
    owners.retain(|existing| existing.controller != Some(true));
    owners.push(owner);
    let patch = json!({
        "metadata": {
            "ownerReferences": owners,
        }
    });
    api.patch(
        &secret.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn reconcile_cluster(cluster: Arc<Cluster>, state: Arc<Bootstrap>) -> ReconcileResult<Action> {
    let object = ObjectId::of(cluster.as_ref());
    let namespace = cluster.namespace().unwrap_or_default();
    let api = Api::<Cluster>::namespaced(state.ctx.client.clone(), &namespace);
    let ctx = &state.ctx;
    observe(CLUSTER_CONTROLLER, &state.backoff, &object, async {
        let (api, object) = (&api, &object);
        finalizer(api, FINALIZER_CLUSTER_CLEANUP, cluster.clone(), |event| async move {
            match event {
                Event::Apply(cluster) => schedule_deletion(api, &cluster, ctx, object).await,
                Event::Cleanup(cluster) => cleanup(&cluster, ctx, object).await,
            }
        })
        .await
        .map_err(|err| from_finalizer_error(object.clone(), err))
    })
    .await
}

#[tracing::instrument(skip_all, fields(%object))]
async fn schedule_deletion(
    api: &Api<Cluster>,
    cluster: &Cluster,
    ctx: &Context,
    object: &ObjectId,
) -> ReconcileResult<Action> {
    let schedule = cluster
        .deletion_schedule()
        .reconcile_err(ErrorKind::Configuration, object, "read deletion schedule")?;
    let step = deletion_step(
        Utc::now(),
        cluster.is_marked_for_deletion(),
        schedule,
        ctx.config.cluster.deletion_grace_period.into(),
    );
    let name = cluster.name_any();

    match step {
        DeletionStep::Idle => Ok(Action::await_change()),
        DeletionStep::Schedule(at) => {
            info!(%at, "scheduling cluster deletion");
            patch_annotations(
                api,
                &name,
                btreemap! { ANNOTATION_DELETION_SCHEDULE => Some(at.to_rfc3339()) },
            )
            .await
            .transient(object, "schedule deletion")?;
            let mut status = cluster.status.clone().unwrap_or_default();
            status.status_conditions.set(
                Condition::new(ConditionType::DeletionScheduled, true)
                    .with_message(format!("cluster will be deleted at {}", at.to_rfc3339())),
            );
            patch_status(api, &name, &status)
                .await
                .transient(object, "update cluster status")?;
            Ok(Action::requeue(ctx.config.cluster.deletion_grace_period.into()))
        }
        DeletionStep::Wait(remaining) => Ok(Action::requeue(remaining)),
        DeletionStep::Delete => {
            info!("deletion schedule passed, deleting cluster");
            api.delete(&name, &DeleteParams::default())
                .await
                .transient(object, "delete cluster")?;
            Ok(Action::await_change())
        }
        DeletionStep::Unschedule => {
            info!("deletion mark removed, dropping schedule");
            patch_annotations(api, &name, btreemap! { ANNOTATION_DELETION_SCHEDULE => None })
                .await
                .transient(object, "unschedule deletion")?;
            let mut status = cluster.status.clone().unwrap_or_default();
            status
                .status_conditions
                .remove(ConditionType::DeletionScheduled);
            patch_status(api, &name, &status)
                .await
                .transient(object, "update cluster status")?;
            Ok(Action::await_change())
        }
    }
}

/// Deletes Plugins targeting the cluster and holds the finalizer until they
/// are gone and no TeamRoleBinding reports bindings on it.
#[tracing::instrument(skip_all, fields(%object))]
async fn cleanup(cluster: &Cluster, ctx: &Context, object: &ObjectId) -> ReconcileResult<Action> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let plugins = Api::<Plugin>::namespaced(ctx.client.clone(), &namespace);
    let targeting: Vec<Plugin> = plugins
        .list(&ListParams::default())
        .await
        .transient(object, "list plugins")?
        .into_iter()
        .filter(|plugin| plugin.spec.cluster_name == name)
        .collect();
    for plugin in &targeting {
        if plugin.meta().deletion_timestamp.is_none() {
            info!(plugin = %plugin.name_any(), "deleting plugin of terminating cluster");
            plugins
                .delete(&plugin.name_any(), &DeleteParams::default())
                .await
                .transient(object, "delete plugin")?;
        }
    }

    let bindings = Api::<TeamRoleBinding>::namespaced(ctx.client.clone(), &namespace)
        .list(&ListParams::default())
        .await
        .transient(object, "list team role bindings")?
        .items;

    let dependents = Dependents::of(&name, &targeting, &bindings);
    if !dependents.is_empty() {
        return Err(ReconcileError::new(
            ErrorKind::Transient,
            object.clone(),
            "cleanup",
            anyhow!(
                "waiting for {} plugins and {} team role bindings to release the cluster",
                dependents.plugins,
                dependents.role_bindings
            ),
        ));
    }

    ctx.tracker.remove(&namespace, &name).await;
    info!("cluster released");
    Ok(Action::await_change())
}
