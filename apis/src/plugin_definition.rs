use crate::schema::preserve_arbitrary;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A deployable, versioned workload backed by a helm chart.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "greenhouse.sap",
    version = "v1alpha1",
    kind = "PluginDefinition",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PluginDefinitionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart: Option<HelmChartReference>,
    #[serde(default)]
    pub options: Vec<PluginOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct HelmChartReference {
    pub name: String,
    pub repository: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginOption {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: PluginOptionType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_arbitrary")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PluginOptionType {
    String,
    Bool,
    Int,
    List,
    Map,
    Secret,
}

impl PluginOptionType {
    /// Whether a literal JSON value is acceptable for an option of this type.
    /// Secret options never accept literals.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
            Self::Secret => false,
        }
    }
}

impl PluginDefinition {
    pub fn option(&self, name: &str) -> Option<&PluginOption> {
        self.spec.options.iter().find(|option| option.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn option_types_accept_matching_literals() {
        assert!(PluginOptionType::String.accepts(&json!("a")));
        assert!(PluginOptionType::Bool.accepts(&json!(true)));
        assert!(PluginOptionType::Int.accepts(&json!(3)));
        assert!(PluginOptionType::List.accepts(&json!([1, "two"])));
        assert!(PluginOptionType::Map.accepts(&json!({"a": 1})));
    }

    #[test]
    fn option_types_reject_mismatches() {
        assert!(!PluginOptionType::String.accepts(&json!(1)));
        assert!(!PluginOptionType::Bool.accepts(&json!("true")));
        assert!(!PluginOptionType::Int.accepts(&json!(1.5)));
        assert!(!PluginOptionType::List.accepts(&json!({})));
        assert!(!PluginOptionType::Map.accepts(&json!([])));
        assert!(!PluginOptionType::Secret.accepts(&json!("s3cr3t")));
    }

    #[test]
    fn deserializes_lowercase_types() {
        let option: PluginOption = serde_json::from_value(json!({
            "name": "a.b",
            "type": "map",
            "required": true,
        }))
        .unwrap();
        assert_eq!(option.type_, PluginOptionType::Map);
        assert!(option.required);
        assert_eq!(option.default, None);
    }
}
