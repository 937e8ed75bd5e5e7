use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "greenhouse.sap", version = "v1alpha1", kind = "Team", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct TeamSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "mappedIdPGroup",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mapped_idp_group: Option<String>,
    #[serde(default)]
    pub members: Vec<User>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
}
