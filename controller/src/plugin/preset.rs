use crate::backoff::Backoff;
use crate::context::{drain, error_policy, observe, Context};
use crate::errors::{
    from_finalizer_error, ErrorKind, ObjectId, ReconcileContext, ReconcileError, ReconcileResult,
};
use crate::k8s::patch_status;
use anyhow::anyhow;
use greenhouse_apis::well_known::{FIELD_MANAGER, FINALIZER_PLUGIN_PRESET, LABEL_PLUGIN_PRESET};
use greenhouse_apis::{
    ApisError, Cluster, Condition, ConditionType, Plugin, PluginPreset, PluginPresetStatus,
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, Controller};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const CONTROLLER: &str = "pluginPreset";

/// Writes needed to bring the Plugins of a preset in line with the clusters.
#[derive(Debug, Default)]
pub struct PresetPlan {
    /// Missing or outdated Plugins.
    pub apply: Vec<Plugin>,
    /// Plugins of the preset on clusters it no longer selects.
    pub delete: Vec<String>,
    /// Plugins in the way of the preset that it does not manage.
    pub conflicts: Vec<String>,
}

fn up_to_date(existing: &Plugin, desired: &Plugin) -> bool {
    existing.spec == desired.spec
        && desired
            .labels()
            .iter()
            .all(|(key, value)| existing.labels().get(key) == Some(value))
}

pub fn plan_preset(
    preset: &PluginPreset,
    clusters: &[Cluster],
    plugins: &[Plugin],
) -> Result<PresetPlan, ApisError> {
    let existing: BTreeMap<String, &Plugin> = plugins
        .iter()
        .map(|plugin| (plugin.name_any(), plugin))
        .collect();

    let mut plan = PresetPlan::default();
    let mut wanted = Vec::new();
    for cluster in clusters {
        if !preset.selects(cluster)? {
            continue;
        }
        let desired = preset.plugin_for(cluster);
        let name = desired.name_any();
        match existing.get(&name) {
            Some(plugin) if !preset.manages(plugin) => plan.conflicts.push(name.clone()),
            Some(plugin) if up_to_date(plugin, &desired) => {}
            _ => plan.apply.push(desired),
        }
        wanted.push(name);
    }

    plan.delete = plugins
        .iter()
        .filter(|plugin| preset.manages(plugin))
        .map(|plugin| plugin.name_any())
        .filter(|name| !wanted.contains(name))
        .collect();
    Ok(plan)
}

struct Presets {
    ctx: Context,
    backoff: Backoff,
}

fn presets_in(store: &Store<PluginPreset>, namespace: Option<String>) -> Vec<ObjectRef<PluginPreset>> {
    store
        .state()
        .into_iter()
        .filter(|preset| preset.namespace() == namespace)
        .map(|preset| ObjectRef::from_obj(preset.as_ref()))
        .collect()
}

/// Keeps one Plugin per selected cluster for every PluginPreset.
pub async fn run(ctx: Context) -> anyhow::Result<()> {
    info!("Starting plugin preset controller");
    let client = ctx.client.clone();
    let controller = Controller::new(
        Api::<PluginPreset>::all(client.clone()),
        watcher::Config::default(),
    );
    let store = controller.store();

    let controller = controller
        .owns(
            Api::<Plugin>::all(client.clone()),
            watcher::Config::default().labels(LABEL_PLUGIN_PRESET),
        )
        .watches(Api::<Cluster>::all(client), watcher::Config::default(), {
            let store = store.clone();
            move |cluster: Cluster| presets_in(&store, cluster.namespace())
        })
        .with_config(ctx.controller_config())
        .run(
            reconcile,
            |preset, err, state| error_policy(CONTROLLER, &state.backoff, preset.as_ref(), err),
            Arc::new(Presets {
                backoff: ctx.backoff(),
                ctx,
            }),
        );
    drain(CONTROLLER, controller).await;
    Ok(())
}

async fn reconcile(preset: Arc<PluginPreset>, state: Arc<Presets>) -> ReconcileResult<Action> {
    let object = ObjectId::of(preset.as_ref());
    let namespace = preset.namespace().unwrap_or_default();
    let presets = Api::<PluginPreset>::namespaced(state.ctx.client.clone(), &namespace);
    let plugins = Api::<Plugin>::namespaced(state.ctx.client.clone(), &namespace);
    let state = state.as_ref();
    observe(CONTROLLER, &state.backoff, &object, async {
        let (presets, plugins, object) = (&presets, &plugins, &object);
        finalizer(presets, FINALIZER_PLUGIN_PRESET, preset.clone(), |event| async move {
            match event {
                Event::Apply(preset) => sync(presets, plugins, &preset, state, object).await,
                Event::Cleanup(preset) => cleanup(plugins, &preset, object).await,
            }
        })
        .await
        .map_err(|err| from_finalizer_error(object.clone(), err))
    })
    .await
}

fn ready(plan: &PresetPlan) -> Condition {
    if plan.conflicts.is_empty() {
        return Condition::new(ConditionType::Ready, true);
    }
    Condition::new(ConditionType::Ready, false)
        .with_reason("PluginConflict")
        .with_message(format!(
            "plugins not managed by this preset already exist: {}",
            plan.conflicts.join(", ")
        ))
}

async fn write_status(
    api: &Api<PluginPreset>,
    preset: &PluginPreset,
    condition: Condition,
    object: &ObjectId,
) -> ReconcileResult<()> {
    let mut status: PluginPresetStatus = preset.status.clone().unwrap_or_default();
    status.status_conditions.set(condition);
    if preset.status.as_ref() == Some(&status) {
        return Ok(());
    }
    patch_status(api, &preset.name_any(), &status)
        .await
        .transient(object, "update plugin preset status")?;
    Ok(())
}

#[tracing::instrument(skip_all, fields(%object))]
async fn sync(
    presets: &Api<PluginPreset>,
    plugins: &Api<Plugin>,
    preset: &PluginPreset,
    state: &Presets,
    object: &ObjectId,
) -> ReconcileResult<Action> {
    let namespace = preset.namespace().unwrap_or_default();
    let clusters = Api::<Cluster>::namespaced(state.ctx.client.clone(), &namespace)
        .list(&ListParams::default())
        .await
        .transient(object, "list clusters")?
        .items;
    let existing = plugins
        .list(&ListParams::default())
        .await
        .transient(object, "list plugins")?
        .items;

    let plan = match plan_preset(preset, &clusters, &existing) {
        Ok(plan) => plan,
        Err(err) => {
            let err = ReconcileError::new(
                ErrorKind::Configuration,
                object.clone(),
                "select clusters",
                err,
            );
            let condition = Condition::new(ConditionType::Ready, false)
                .with_reason(err.kind.reason())
                .with_message(err.status_message());
            write_status(presets, preset, condition, object).await?;
            return Err(err);
        }
    };

    let params = PatchParams::apply(FIELD_MANAGER).force();
    for plugin in &plan.apply {
        info!(plugin = %plugin.name_any(), cluster = %plugin.spec.cluster_name, "applying plugin");
        plugins
            .patch(&plugin.name_any(), &params, &Patch::Apply(plugin))
            .await
            .transient(object, "apply plugin")?;
    }
    for name in &plan.delete {
        info!(plugin = %name, "deleting plugin of deselected cluster");
        delete_plugin(plugins, name)
            .await
            .transient(object, "delete plugin")?;
    }

    write_status(presets, preset, ready(&plan), object).await?;
    if !plan.conflicts.is_empty() {
        return Err(ReconcileError::new(
            ErrorKind::Configuration,
            object.clone(),
            "apply plugins",
            anyhow!("conflicting plugins: {}", plan.conflicts.join(", ")),
        ));
    }
    Ok(Action::await_change())
}

async fn delete_plugin(plugins: &Api<Plugin>, name: &str) -> Result<(), kube::Error> {
    match plugins.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}

/// Deletes the preset's Plugins and holds the finalizer until they are gone,
/// so their releases are uninstalled first.
#[tracing::instrument(skip_all, fields(%object))]
async fn cleanup(
    plugins: &Api<Plugin>,
    preset: &PluginPreset,
    object: &ObjectId,
) -> ReconcileResult<Action> {
    let selector = format!("{LABEL_PLUGIN_PRESET}={}", preset.name_any());
    let remaining = plugins
        .list(&ListParams::default().labels(&selector))
        .await
        .transient(object, "list plugins")?
        .items;
    if remaining.is_empty() {
        info!("plugins of preset removed");
        return Ok(Action::await_change());
    }

    for plugin in remaining.iter().filter(|plugin| plugin.metadata.deletion_timestamp.is_none()) {
        info!(plugin = %plugin.name_any(), "deleting plugin of removed preset");
        delete_plugin(plugins, &plugin.name_any())
            .await
            .transient(object, "delete plugin")?;
    }
    Err(ReconcileError::new(
        ErrorKind::Transient,
        object.clone(),
        "cleanup",
        anyhow!("waiting for {} plugins to be uninstalled", remaining.len()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenhouse_apis::{ClusterSpec, PluginPresetSpec, PluginSpec, PluginTemplate};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use maplit::btreemap;

    fn preset() -> PluginPreset {
        let mut preset = PluginPreset::new(
            "logging",
            PluginPresetSpec {
                plugin: PluginTemplate {
                    plugin_definition: "fluent-bit".to_owned(),
                    ..Default::default()
                },
                cluster_selector: LabelSelector {
                    match_labels: Some(btreemap! {"env".to_owned() => "prod".to_owned()}),
                    ..Default::default()
                },
                cluster_option_overrides: vec![],
            },
        );
        preset.metadata.namespace = Some("org".to_owned());
        preset.metadata.uid = Some("8a2f".to_owned());
        preset
    }

    fn cluster(name: &str, env: &str) -> Cluster {
        let mut cluster = Cluster::new(name, ClusterSpec::default());
        cluster.metadata.namespace = Some("org".to_owned());
        cluster.metadata.labels = Some(btreemap! {"env".to_owned() => env.to_owned()});
        cluster
    }

    fn names(plugins: &[Plugin]) -> Vec<String> {
        plugins.iter().map(|plugin| plugin.name_any()).collect()
    }

    #[test]
    fn creates_plugins_for_selected_clusters() {
        let clusters = [cluster("eu", "prod"), cluster("us", "prod"), cluster("lab", "dev")];
        let plan = plan_preset(&preset(), &clusters, &[]).unwrap();
        assert_eq!(names(&plan.apply), vec!["logging-eu", "logging-us"]);
        assert!(plan.delete.is_empty());
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn up_to_date_plugins_are_left_alone() {
        let preset = preset();
        let clusters = [cluster("eu", "prod")];
        let existing = [preset.plugin_for(&clusters[0])];
        let plan = plan_preset(&preset, &clusters, &existing).unwrap();
        assert!(plan.apply.is_empty() && plan.delete.is_empty() && plan.conflicts.is_empty());

        let mut drifted = existing[0].clone();
        drifted.spec.release_namespace = Some("elsewhere".to_owned());
        let plan = plan_preset(&preset, &clusters, &[drifted]).unwrap();
        assert_eq!(names(&plan.apply), vec!["logging-eu"]);
    }

    #[test]
    fn deselected_clusters_lose_their_plugin() {
        let preset = preset();
        let existing = [
            preset.plugin_for(&cluster("eu", "prod")),
            preset.plugin_for(&cluster("us", "prod")),
        ];
        let clusters = [cluster("eu", "prod"), cluster("us", "dev")];
        let plan = plan_preset(&preset, &clusters, &existing).unwrap();
        assert!(plan.apply.is_empty());
        assert_eq!(plan.delete, vec!["logging-us"]);
    }

    #[test]
    fn foreign_plugins_are_conflicts() {
        let mut foreign = Plugin::new(
            "logging-eu",
            PluginSpec {
                plugin_definition: "fluent-bit".to_owned(),
                cluster_name: "eu".to_owned(),
                ..Default::default()
            },
        );
        foreign.metadata.namespace = Some("org".to_owned());
        let unrelated = Plugin::new("metrics", PluginSpec::default());

        let plan =
            plan_preset(&preset(), &[cluster("eu", "prod")], &[foreign, unrelated]).unwrap();
        assert!(plan.apply.is_empty());
        assert!(plan.delete.is_empty());
        assert_eq!(plan.conflicts, vec!["logging-eu"]);
        assert!(!ready(&plan).is_true());
    }
}
