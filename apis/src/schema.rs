use schemars::gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject};

/// Schema for fields holding arbitrary JSON (option values and defaults).
pub(crate) fn preserve_arbitrary(_gen: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject::default();
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_owned(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(obj)
}
