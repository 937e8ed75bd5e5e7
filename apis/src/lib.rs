pub mod kubeconfig;
pub mod well_known;

mod conditions;
pub use conditions::*;

mod errors;
pub use errors::*;

mod cluster;
pub use cluster::*;

mod organization;
pub use organization::*;

mod plugin;
pub use plugin::*;

mod plugin_definition;
pub use plugin_definition::*;

mod plugin_preset;
pub use plugin_preset::*;

mod team;
pub use team::*;

mod team_role;
pub use team_role::*;

mod team_role_binding;
pub use team_role_binding::*;

mod schema;

use kube::CustomResourceExt;

/// Every custom resource definition served under the `greenhouse.sap` group.
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        Organization::crd(),
        Cluster::crd(),
        PluginDefinition::crd(),
        Plugin::crd(),
        PluginPreset::crd(),
        Team::crd(),
        TeamRole::crd(),
        TeamRoleBinding::crd(),
    ]
}
