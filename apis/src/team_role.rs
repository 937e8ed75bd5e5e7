use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The set of permissions materialized as a Role on target clusters.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "greenhouse.sap", version = "v1alpha1", kind = "TeamRole", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct TeamRoleSpec {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}
