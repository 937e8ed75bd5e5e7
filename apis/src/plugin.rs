use crate::schema::preserve_arbitrary;
use crate::{HelmChartReference, StatusConditions};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An instance of a PluginDefinition deployed onto one cluster.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "greenhouse.sap",
    version = "v1alpha1",
    kind = "Plugin",
    namespaced,
    status = "PluginStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Release","type":"string","jsonPath":".status.releaseState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    pub plugin_definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_namespace: Option<String>,
    #[serde(default)]
    pub option_values: Vec<PluginOptionValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginOptionValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_arbitrary")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFromSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ValueFromSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretKeyReference>,
}

/// A key of a Secret in the namespace of the referencing object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, strum::Display,
)]
pub enum ReleaseState {
    #[default]
    NotInstalled,
    Installing,
    Installed,
    Failed,
    Uninstalling,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    #[serde(default)]
    pub release_state: ReleaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart: Option<HelmChartReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_revision: Option<i64>,
    #[serde(default)]
    pub status_conditions: StatusConditions,
}

impl Plugin {
    /// Namespace on the remote cluster the release is installed into.
    pub fn release_namespace(&self) -> String {
        self.spec
            .release_namespace
            .clone()
            .or_else(|| self.namespace())
            .unwrap_or_default()
    }

    pub fn release_name(&self) -> String {
        self.name_any()
    }

    pub fn release_state(&self) -> ReleaseState {
        self.status
            .as_ref()
            .map(|status| status.release_state)
            .unwrap_or_default()
    }
}
