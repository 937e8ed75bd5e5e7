use crate::errors::ErrorKind;
use async_trait::async_trait;
use greenhouse_apis::{Plugin, PluginDefinition, PluginOptionType, PluginOptionValue};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Read access to Secrets referenced by option values.
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, kube::Error>;
}

pub struct KubeSecretReader {
    client: kube::Client,
}

impl KubeSecretReader {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, kube::Error> {
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?;
        Ok(secret.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValuesError {
    #[error("required option {0} has no value")]
    RequiredOptionMissing(String),

    #[error("option {0} is a secret and must be set from a secret reference")]
    SecretAsLiteral(String),

    #[error("option {option} expects a value of type {expected}")]
    TypeMismatch {
        option: String,
        expected: PluginOptionType,
    },

    #[error("option {0} sets neither value nor valueFrom")]
    EmptyValue(String),

    #[error("secret {secret} referenced by option {option} not found")]
    SecretNotFound { option: String, secret: String },

    #[error("key {key} of secret {secret} referenced by option {option} not found")]
    SecretKeyNotFound {
        option: String,
        secret: String,
        key: String,
    },

    #[error("key {key} of secret {secret} referenced by option {option} is not valid UTF-8")]
    SecretNotUtf8 {
        option: String,
        secret: String,
        key: String,
    },

    #[error("Failed reading secret {secret}: {source}")]
    Lookup {
        secret: String,
        source: kube::Error,
    },
}

impl ValuesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Lookup { .. } => ErrorKind::Transient,
            _ => ErrorKind::Validation,
        }
    }
}

/// Injected under `global.greenhouse` into every release.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalValues {
    pub cluster_name: String,
    pub organization_name: String,
    pub base_domain: String,
    pub team_names: Vec<String>,
}

impl GlobalValues {
    fn to_values(&self) -> Value {
        json!({
            "global": {
                "greenhouse": self,
            }
        })
    }
}

/// Layers the values of a release, lowest precedence first: chart defaults,
/// option defaults of the definition, injected globals, option values of the
/// plugin.
pub async fn resolve_values(
    chart_defaults: &Value,
    definition: &PluginDefinition,
    plugin: &Plugin,
    globals: &GlobalValues,
    secrets: &dyn SecretReader,
) -> Result<Value, ValuesError> {
    check_required(definition, plugin)?;

    let mut values = match chart_defaults {
        Value::Object(_) => chart_defaults.clone(),
        _ => Value::Object(Map::new()),
    };

    let mut defaults = Map::new();
    for option in &definition.spec.options {
        if let Some(default) = &option.default {
            set_path(&mut defaults, &option.name, default.clone());
        }
    }
    merge_values(&mut values, Value::Object(defaults));

    merge_values(&mut values, globals.to_values());

    let namespace = plugin.namespace().unwrap_or_default();
    let mut overrides = Map::new();
    for option_value in &plugin.spec.option_values {
        let value = resolve_option(definition, &namespace, option_value, secrets).await?;
        set_path(&mut overrides, &option_value.name, value);
    }
    merge_values(&mut values, Value::Object(overrides));

    Ok(values)
}

fn check_required(definition: &PluginDefinition, plugin: &Plugin) -> Result<(), ValuesError> {
    let supplied: BTreeSet<&str> = plugin
        .spec
        .option_values
        .iter()
        .map(|value| value.name.as_str())
        .collect();
    match definition.spec.options.iter().find(|option| {
        option.required && option.default.is_none() && !supplied.contains(option.name.as_str())
    }) {
        Some(option) => Err(ValuesError::RequiredOptionMissing(option.name.clone())),
        None => Ok(()),
    }
}

async fn resolve_option(
    definition: &PluginDefinition,
    namespace: &str,
    option_value: &PluginOptionValue,
    secrets: &dyn SecretReader,
) -> Result<Value, ValuesError> {
    let name = &option_value.name;
    let declared = definition.option(name).map(|option| option.type_);

    if let Some(value) = &option_value.value {
        return match declared {
            Some(PluginOptionType::Secret) => Err(ValuesError::SecretAsLiteral(name.clone())),
            Some(expected) if !expected.accepts(value) => Err(ValuesError::TypeMismatch {
                option: name.clone(),
                expected,
            }),
            _ => Ok(value.clone()),
        };
    }

    let Some(reference) = option_value
        .value_from
        .as_ref()
        .and_then(|from| from.secret.as_ref())
    else {
        return Err(ValuesError::EmptyValue(name.clone()));
    };

    let data = secrets
        .secret_data(namespace, &reference.name)
        .await
        .map_err(|source| ValuesError::Lookup {
            secret: reference.name.clone(),
            source,
        })?
        .ok_or_else(|| ValuesError::SecretNotFound {
            option: name.clone(),
            secret: reference.name.clone(),
        })?;
    let bytes = data
        .get(&reference.key)
        .ok_or_else(|| ValuesError::SecretKeyNotFound {
            option: name.clone(),
            secret: reference.name.clone(),
            key: reference.key.clone(),
        })?;
    let value = String::from_utf8(bytes.clone()).map_err(|_| ValuesError::SecretNotUtf8 {
        option: name.clone(),
        secret: reference.name.clone(),
        key: reference.key.clone(),
    })?;
    Ok(Value::String(value))
}

/// Inserts `value` at a dotted path, creating intermediate maps and
/// replacing scalars that are in the way.
pub fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    let mut cur_node = map;
    let mut parts = path.split('.').peekable();

    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            cur_node.insert(part.to_owned(), value);
            return;
        }
        let next = cur_node
            .entry(part.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        let Value::Object(next) = next else {
            return;
        };
        cur_node = next;
    }
}

/// Maps merge key by key, anything else in `overlay` replaces `base`.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Dotted paths whose values differ. Values themselves are left out, they
/// may hold secrets.
pub fn changed_paths(old: &Value, new: &Value) -> BTreeSet<String> {
    if old == new {
        return Default::default();
    }
    match (old, new) {
        (Value::Object(old_obj), Value::Object(new_obj)) => {
            let mut paths = BTreeSet::new();
            for (key, old_value) in old_obj {
                match new_obj.get(key) {
                    Some(new_value) => {
                        for inner in changed_paths(old_value, new_value) {
                            paths.insert(join_path(key, &inner));
                        }
                    }
                    None => {
                        paths.insert(key.to_owned());
                    }
                }
            }
            for key in new_obj.keys() {
                if !old_obj.contains_key(key) {
                    paths.insert(key.to_owned());
                }
            }
            paths
        }
        _ => BTreeSet::from([String::new()]),
    }
}

fn join_path(prefix: &str, suffix: &str) -> String {
    [prefix, suffix]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<&str>>()
        .join(".")
}
