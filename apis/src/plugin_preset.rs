use crate::well_known::{LABEL_PLUGIN_DEFINITION, LABEL_PLUGIN_PRESET};
use crate::{ApisError, Cluster, Plugin, PluginOptionValue, PluginSpec, StatusConditions};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};
use kube::{CustomResource, Resource, ResourceExt};
use maplit::btreemap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Deploys the same plugin onto every cluster matched by a selector.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "greenhouse.sap",
    version = "v1alpha1",
    kind = "PluginPreset",
    namespaced,
    status = "PluginPresetStatus",
    printcolumn = r#"{"name":"Definition","type":"string","jsonPath":".spec.plugin.pluginDefinition"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PluginPresetSpec {
    pub plugin: PluginTemplate,
    pub cluster_selector: LabelSelector,
    #[serde(default)]
    pub cluster_option_overrides: Vec<ClusterOptionOverride>,
}

/// A Plugin spec without the target cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginTemplate {
    pub plugin_definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_namespace: Option<String>,
    #[serde(default)]
    pub option_values: Vec<PluginOptionValue>,
}

/// Option values replacing the template's on one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOptionOverride {
    pub cluster_name: String,
    #[serde(default)]
    pub overrides: Vec<PluginOptionValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginPresetStatus {
    #[serde(default)]
    pub status_conditions: StatusConditions,
}

impl PluginPreset {
    /// Terminating clusters are never selected.
    pub fn selects(&self, cluster: &Cluster) -> Result<bool, ApisError> {
        if cluster.is_terminating() {
            return Ok(false);
        }
        let selector = Selector::try_from(self.spec.cluster_selector.clone())?;
        Ok(selector.matches(cluster.labels()))
    }

    pub fn plugin_name(&self, cluster_name: &str) -> String {
        format!("{}-{cluster_name}", self.name_any())
    }

    /// Whether the plugin was created by this preset.
    pub fn manages(&self, plugin: &Plugin) -> bool {
        plugin.labels().get(LABEL_PLUGIN_PRESET) == Some(&self.name_any())
    }

    pub fn option_values_for(&self, cluster_name: &str) -> Vec<PluginOptionValue> {
        let mut values = self.spec.plugin.option_values.clone();
        let overrides = self
            .spec
            .cluster_option_overrides
            .iter()
            .filter(|entry| entry.cluster_name == cluster_name)
            .flat_map(|entry| entry.overrides.iter());
        for value in overrides {
            match values.iter_mut().find(|existing| existing.name == value.name) {
                Some(existing) => *existing = value.clone(),
                None => values.push(value.clone()),
            }
        }
        values
    }

    /// The Plugin this preset wants on `cluster`, labelled and owned by it.
    pub fn plugin_for(&self, cluster: &Cluster) -> Plugin {
        let cluster_name = cluster.name_any();
        let template = &self.spec.plugin;
        let mut plugin = Plugin::new(
            &self.plugin_name(&cluster_name),
            PluginSpec {
                plugin_definition: template.plugin_definition.clone(),
                display_name: template.display_name.clone(),
                cluster_name: cluster_name.clone(),
                release_namespace: template.release_namespace.clone(),
                option_values: self.option_values_for(&cluster_name),
            },
        );
        plugin.metadata.namespace = self.namespace();
        plugin.metadata.labels = Some(btreemap! {
            LABEL_PLUGIN_PRESET.to_owned() => self.name_any(),
            LABEL_PLUGIN_DEFINITION.to_owned() => template.plugin_definition.clone(),
        });
        plugin.metadata.owner_references = self.controller_owner_ref(&()).map(|owner| vec![owner]);
        plugin
    }
}
