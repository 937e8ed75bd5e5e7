//! Names shared between the admission webhook, the controllers and the
//! objects they create on remote clusters.

pub const GROUP: &str = "greenhouse.sap";
pub const VERSION: &str = "v1alpha1";

/// Type of secrets holding the access configuration of a remote cluster.
pub const SECRET_TYPE_KUBECONFIG: &str = "greenhouse.sap/kubeconfig";
/// Client config provided by the user registering the cluster.
pub const KUBECONFIG_KEY: &str = "kubeconfig";
/// Client config maintained by the operator, carrying a short-lived token.
pub const GREENHOUSE_KUBECONFIG_KEY: &str = "greenhousekubeconfig";

pub const ANNOTATION_DELETE_CLUSTER: &str = "greenhouse.sap/delete-cluster";
pub const ANNOTATION_DELETION_SCHEDULE: &str = "greenhouse.sap/deletion-schedule";

pub const FINALIZER_HELM: &str = "greenhouse.sap/helm";
pub const FINALIZER_PROPAGATED_RESOURCE: &str = "greenhouse.sap/propagatedResource";
pub const FINALIZER_CLUSTER_CLEANUP: &str = "greenhouse.sap/cleanup";
pub const FINALIZER_PLUGIN_PRESET: &str = "greenhouse.sap/pluginpreset";

pub const LABEL_CLUSTER: &str = "greenhouse.sap/cluster";
pub const LABEL_PLUGIN: &str = "greenhouse.sap/plugin";
pub const LABEL_PLUGIN_DEFINITION: &str = "greenhouse.sap/plugindefinition";
/// Names the PluginPreset that created a Plugin.
pub const LABEL_PLUGIN_PRESET: &str = "greenhouse.sap/pluginpreset";
pub const LABEL_ROLE: &str = "greenhouse.sap/role";
pub const LABEL_ROLE_BINDING: &str = "greenhouse.sap/rolebinding";

/// Prefix of every RBAC object materialized on remote clusters.
pub const RBAC_PREFIX: &str = "greenhouse:";

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "greenhouse";

pub fn rbac_name(name: &str) -> String {
    format!("{RBAC_PREFIX}{name}")
}
