use crate::{ApisError, Cluster, Condition, StatusConditions};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Assigns a TeamRole to a Team on a set of clusters and namespaces.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "greenhouse.sap",
    version = "v1alpha1",
    kind = "TeamRoleBinding",
    namespaced,
    status = "TeamRoleBindingStatus",
    printcolumn = r#"{"name":"Team","type":"string","jsonPath":".spec.teamRef"}"#,
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.teamRoleRef"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TeamRoleBindingSpec {
    pub team_role_ref: String,
    pub team_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TeamRoleBindingStatus {
    /// Where RoleBindings currently exist. Used to clean up clusters that
    /// leave the target set.
    #[serde(default)]
    pub propagation_status: Vec<PropagationStatus>,
    #[serde(default)]
    pub status_conditions: StatusConditions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PropagationStatus {
    pub cluster_name: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
    pub condition: Condition,
}

impl TeamRoleBinding {
    /// Whether the given cluster is named directly or matched by the selector.
    pub fn targets(&self, cluster: &Cluster) -> Result<bool, ApisError> {
        if self.spec.cluster_name.as_deref() == Some(cluster.name_any().as_str()) {
            return Ok(true);
        }
        match &self.spec.cluster_selector {
            Some(selector) => {
                let selector = Selector::try_from(selector.clone())?;
                Ok(selector.matches(cluster.labels()))
            }
            None => Ok(false),
        }
    }

    pub fn propagated_clusters(&self) -> impl Iterator<Item = &PropagationStatus> {
        self.status
            .iter()
            .flat_map(|status| status.propagation_status.iter())
    }
}
