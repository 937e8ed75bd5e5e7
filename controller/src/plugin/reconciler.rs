use super::helm::{ChartRef, HelmCli, HelmEngine, KubeCrdStore, ReleaseRequest, UninstallOutcome};
use super::release::{ReleasePlan, ReleaseTarget};
use super::values::{resolve_values, GlobalValues, KubeSecretReader};
use crate::backoff::Backoff;
use crate::context::{drain, error_policy, observe, with_timeout, Context};
use crate::errors::{
    from_finalizer_error, ErrorKind, ObjectId, ReconcileContext, ReconcileError, ReconcileResult,
};
use crate::k8s::patch_status;
use anyhow::anyhow;
use greenhouse_apis::well_known::FINALIZER_HELM;
use greenhouse_apis::{
    Cluster, Condition, ConditionType, Plugin, PluginDefinition, PluginStatus, ReleaseState, Team,
};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, Controller};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::info;

const CONTROLLER: &str = "plugin";

struct Plugins {
    ctx: Context,
    backoff: Backoff,
    engine: Arc<dyn HelmEngine>,
}

fn plugins_where(
    store: &Store<Plugin>,
    namespace: Option<String>,
    filter: impl Fn(&Plugin) -> bool,
) -> Vec<ObjectRef<Plugin>> {
    store
        .state()
        .into_iter()
        .filter(|plugin| namespace.is_none() || plugin.namespace() == namespace)
        .filter(|plugin| filter(plugin))
        .map(|plugin| ObjectRef::from_obj(plugin.as_ref()))
        .collect()
}

fn references_secret(plugin: &Plugin, name: &str) -> bool {
    plugin.spec.option_values.iter().any(|value| {
        value
            .value_from
            .as_ref()
            .and_then(|from| from.secret.as_ref())
            .is_some_and(|secret| secret.name == name)
    })
}

/// Installs, upgrades and uninstalls the helm release behind every Plugin.
pub async fn run(ctx: Context) -> anyhow::Result<()> {
    info!("Starting plugin controller");
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<Plugin>::all(client.clone()), watcher::Config::default());
    let store = controller.store();

    let controller = controller
        .watches(Api::<PluginDefinition>::all(client.clone()), watcher::Config::default(), {
            let store = store.clone();
            move |definition: PluginDefinition| {
                let name = definition.name_any();
                plugins_where(&store, None, |plugin| plugin.spec.plugin_definition == name)
            }
        })
        .watches(Api::<Secret>::all(client.clone()), watcher::Config::default(), {
            let store = store.clone();
            move |secret: Secret| {
                let name = secret.name_any();
                plugins_where(&store, secret.namespace(), |plugin| {
                    references_secret(plugin, &name)
                })
            }
        })
        .watches(Api::<Cluster>::all(client.clone()), watcher::Config::default(), {
            let store = store.clone();
            move |cluster: Cluster| {
                let name = cluster.name_any();
                plugins_where(&store, cluster.namespace(), |plugin| {
                    plugin.spec.cluster_name == name
                })
            }
        })
        .watches(Api::<Team>::all(client), watcher::Config::default(), {
            let store = store.clone();
            move |team: Team| plugins_where(&store, team.namespace(), |_| true)
        })
        .with_config(ctx.controller_config())
        .run(
            reconcile,
            |plugin, err, state| error_policy(CONTROLLER, &state.backoff, plugin.as_ref(), err),
            Arc::new(Plugins {
                engine: Arc::new(HelmCli::new(ctx.config.plugins.helm_binary.clone())),
                backoff: ctx.backoff(),
                ctx,
            }),
        );
    drain(CONTROLLER, controller).await;
    Ok(())
}

async fn reconcile(plugin: Arc<Plugin>, state: Arc<Plugins>) -> ReconcileResult<Action> {
    let object = ObjectId::of(plugin.as_ref());
    let namespace = plugin.namespace().unwrap_or_default();
    let api = Api::<Plugin>::namespaced(state.ctx.client.clone(), &namespace);
    let state = state.as_ref();
    observe(CONTROLLER, &state.backoff, &object, async {
        let (api, object) = (&api, &object);
        finalizer(api, FINALIZER_HELM, plugin.clone(), |event| async move {
            match event {
                Event::Apply(plugin) => install(api, &plugin, state, object).await,
                Event::Cleanup(plugin) => uninstall(api, &plugin, state, object).await,
            }
        })
        .await
        .map_err(|err| from_finalizer_error(object.clone(), err))
    })
    .await
}

/// Writes the status subresource only when it differs from the last write.
struct StatusWriter<'a> {
    api: &'a Api<Plugin>,
    name: String,
    written: Option<PluginStatus>,
}

impl<'a> StatusWriter<'a> {
    fn new(api: &'a Api<Plugin>, plugin: &Plugin) -> Self {
        Self {
            api,
            name: plugin.name_any(),
            written: plugin.status.clone(),
        }
    }

    async fn write(&mut self, status: &PluginStatus, object: &ObjectId) -> ReconcileResult<()> {
        if self.written.as_ref() == Some(status) {
            return Ok(());
        }
        patch_status(self.api, &self.name, status)
            .await
            .transient(object, "update plugin status")?;
        self.written = Some(status.clone());
        Ok(())
    }
}

#[tracing::instrument(skip_all, fields(%object))]
async fn install(
    api: &Api<Plugin>,
    plugin: &Plugin,
    state: &Plugins,
    object: &ObjectId,
) -> ReconcileResult<Action> {
    let mut writer = StatusWriter::new(api, plugin);
    let mut status = plugin.status.clone().unwrap_or_default();

    let result = deploy(plugin, state, object, &mut writer, &mut status).await;
    match &result {
        Ok(()) => {
            status
                .status_conditions
                .set(Condition::new(ConditionType::HelmReconcileFailed, false));
            status
                .status_conditions
                .set(Condition::new(ConditionType::Ready, true));
        }
        Err(err) => {
            status.status_conditions.set(
                Condition::new(ConditionType::HelmReconcileFailed, true)
                    .with_reason(err.kind.reason())
                    .with_message(err.status_message()),
            );
            status.status_conditions.set(
                Condition::new(ConditionType::Ready, false)
                    .with_reason(err.kind.reason())
                    .with_message(err.status_message()),
            );
        }
    }
    writer.write(&status, object).await?;
    result?;
    Ok(Action::requeue(
        state.ctx.config.plugins.resync_interval.into(),
    ))
}

/// The chart a definition deploys. Definitions without one cannot be
/// installed until they are fixed.
fn chart_of(definition: &PluginDefinition, object: &ObjectId) -> ReconcileResult<ChartRef> {
    definition
        .spec
        .helm_chart
        .as_ref()
        .map(ChartRef::from)
        .ok_or_else(|| {
            ReconcileError::new(
                ErrorKind::Configuration,
                object.clone(),
                "resolve chart",
                anyhow!("no helm chart defined in pluginDefinition.Spec.HelmChart"),
            )
        })
}

/// Brings the release in line with the Plugin. `status.release_state` moves
/// to `Installing` before the first mutation and to `Failed` if it fails.
async fn deploy(
    plugin: &Plugin,
    state: &Plugins,
    object: &ObjectId,
    writer: &mut StatusWriter<'_>,
    status: &mut PluginStatus,
) -> ReconcileResult<()> {
    let ctx = &state.ctx;
    let timeout = ctx.remote_timeout();
    let namespace = plugin.namespace().unwrap_or_default();

    let definition = Api::<PluginDefinition>::all(ctx.client.clone())
        .get_opt(&plugin.spec.plugin_definition)
        .await
        .transient(object, "get plugin definition")?
        .ok_or_else(|| {
            ReconcileError::new(
                ErrorKind::Configuration,
                object.clone(),
                "get plugin definition",
                anyhow!(
                    "plugin definition {} not found",
                    plugin.spec.plugin_definition
                ),
            )
        })?;
    let chart_ref = chart_of(&definition, object)?;

    let cluster_name = &plugin.spec.cluster_name;
    let cluster = Api::<Cluster>::namespaced(ctx.client.clone(), &namespace)
        .get_opt(cluster_name)
        .await
        .transient(object, "get cluster")?;
    match cluster {
        None => {
            return Err(ReconcileError::new(
                ErrorKind::Transient,
                object.clone(),
                "get cluster",
                anyhow!("cluster {cluster_name} not found"),
            ))
        }
        Some(cluster) if !cluster.is_usable() => {
            return Err(ReconcileError::new(
                ErrorKind::Transient,
                object.clone(),
                "get cluster",
                anyhow!(
                    "cluster {cluster_name} is not ready ({})",
                    cluster.access_state()
                ),
            ))
        }
        Some(_) => {}
    }
    let remote = ctx
        .tracker
        .get_or_load(&ctx.client, &namespace, cluster_name, timeout)
        .await
        .transient(object, "connect to cluster")?;

    let chart = with_timeout(timeout, state.engine.load_chart(&chart_ref))
        .await
        .transient(object, "load chart")?;

    let mut team_names: Vec<String> = Api::<Team>::namespaced(ctx.client.clone(), &namespace)
        .list(&ListParams::default())
        .await
        .transient(object, "list teams")?
        .iter()
        .map(|team| team.name_any())
        .collect();
    team_names.sort();
    let globals = GlobalValues {
        cluster_name: cluster_name.clone(),
        organization_name: namespace.clone(),
        base_domain: ctx.config.plugins.dns_domain.clone(),
        team_names,
    };
    let values = resolve_values(
        &chart.default_values,
        &definition,
        plugin,
        &globals,
        &KubeSecretReader::new(ctx.client.clone()),
    )
    .await
    .map_err(|err| ReconcileError::new(err.kind(), object.clone(), "resolve values", err))?;

    let request = ReleaseRequest {
        name: plugin.release_name(),
        namespace: plugin.release_namespace(),
        chart: chart_ref,
        values,
    };
    let crds = KubeCrdStore::new(remote.client.clone());
    let target = ReleaseTarget {
        engine: state.engine.as_ref(),
        crds: &crds,
        kubeconfig: &remote.kubeconfig,
    };

    let plan = with_timeout(timeout, target.plan(&chart, &request))
        .await
        .transient(object, "plan release")?;
    if plan.is_mutation() {
        status.release_state = ReleaseState::Installing;
        writer.write(status, object).await?;
    }
    if let ReleasePlan::Unchanged(_) = &plan {
        info!("release is up to date");
    }
    let release = match with_timeout(timeout, target.apply(&chart, &request, plan)).await {
        Ok(release) => release,
        Err(err) => {
            status.release_state = ReleaseState::Failed;
            return Err(ReconcileError::new(
                ErrorKind::Transient,
                object.clone(),
                "apply release",
                err,
            ));
        }
    };

    status.release_state = ReleaseState::Installed;
    status.release_revision = Some(release.revision);
    status.helm_chart = definition.spec.helm_chart.clone();
    Ok(())
}

#[tracing::instrument(skip_all, fields(%object))]
async fn uninstall(
    api: &Api<Plugin>,
    plugin: &Plugin,
    state: &Plugins,
    object: &ObjectId,
) -> ReconcileResult<Action> {
    let ctx = &state.ctx;
    let timeout = ctx.remote_timeout();
    let namespace = plugin.namespace().unwrap_or_default();
    let cluster_name = &plugin.spec.cluster_name;

    let cluster = Api::<Cluster>::namespaced(ctx.client.clone(), &namespace)
        .get_opt(cluster_name)
        .await
        .transient(object, "get cluster")?;
    match cluster {
        None => {
            info!(cluster = %cluster_name, "cluster is gone, nothing to uninstall");
            return Ok(Action::await_change());
        }
        Some(cluster) if !cluster.is_reachable() && cluster.is_terminating() => {
            info!(cluster = %cluster_name, "terminating cluster is unreachable, skipping uninstall");
            return Ok(Action::await_change());
        }
        Some(cluster) if !cluster.is_reachable() => {
            return Err(ReconcileError::new(
                ErrorKind::Transient,
                object.clone(),
                "get cluster",
                anyhow!(
                    "cluster {cluster_name} is not ready ({})",
                    cluster.access_state()
                ),
            ))
        }
        Some(_) => {}
    }

    let mut writer = StatusWriter::new(api, plugin);
    let mut status = plugin.status.clone().unwrap_or_default();
    status.release_state = ReleaseState::Uninstalling;
    writer.write(&status, object).await?;

    let remote = ctx
        .tracker
        .get_or_load(&ctx.client, &namespace, cluster_name, timeout)
        .await
        .transient(object, "connect to cluster")?;
    let crds = KubeCrdStore::new(remote.client.clone());
    let target = ReleaseTarget {
        engine: state.engine.as_ref(),
        crds: &crds,
        kubeconfig: &remote.kubeconfig,
    };
    let release_namespace = plugin.release_namespace();
    let release_name = plugin.release_name();
    match with_timeout(timeout, target.remove(&release_namespace, &release_name))
        .await
        .transient(object, "uninstall release")?
    {
        UninstallOutcome::NotFound => info!("release not found, nothing to uninstall"),
        UninstallOutcome::Uninstalled => info!("release uninstalled"),
    }
    Ok(Action::await_change())
}
