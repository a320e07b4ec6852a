//! Rendered resource documents.
//!
//! Render and plugin commands print YAML document streams. Each document is
//! kept as a loosely-typed [`serde_yaml::Value`] so unknown kinds pass
//! through untouched; only `kind` and `metadata` are interpreted.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Prefix of every provenance annotation key
pub const ANNOTATION_PREFIX: &str = "com.shieldsbetter.pelton/";

/// Label carrying the root activation, used as the prune selector
pub const ROOT_ACTIVATION_LABEL: &str = "com-shieldsbetter-pelton-root-activation";

/// Provenance annotation names (without prefix)
pub mod annotations {
    pub const SOURCE_ACTIVATION: &str = "sourceActivation";
    pub const SOURCE_ACTIVATION_DNS: &str = "sourceActivationDns";
    pub const SOURCE_ACTIVATION_ENVIRONMENT: &str = "sourceActivationEnvironment";
    pub const SOURCE_ACTIVATION_ISOLATION: &str = "sourceActivationIsolation";
    pub const ROOT_ACTIVATION: &str = "rootActivation";
    pub const DEPENDENCY_ACTIVATION_IDS: &str = "dependencyActivationIds";
    pub const SOURCE_PROJECT_CONFIG: &str = "sourceProjectConfig";
    pub const SOURCE_PROJECT_DIRECTORY: &str = "sourceProjectDirectory";
}

/// Full annotation key for a provenance name
pub fn annotation_key(name: &str) -> String {
    format!("{}{}", ANNOTATION_PREFIX, name)
}

/// Output that is not a valid resource-document stream
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Error parsing manifest of {activation}: {message}\n{raw}")]
    Manifest {
        activation: String,
        raw: String,
        message: String,
    },

    #[error("Plugin \"{plugin}\" generated bad yaml: {message}\n{raw}")]
    Plugin {
        plugin: String,
        raw: String,
        message: String,
    },
}

/// One cluster resource document
#[derive(Debug, Clone, PartialEq)]
pub struct Resource(Mapping);

impl Resource {
    /// Wrap a document, which must be a mapping
    pub fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Mapping(map) => Ok(Self(map)),
            other => Err(format!(
                "resource document must be a mapping, got: {}",
                serde_yaml::to_string(&other)
                    .unwrap_or_else(|_| format!("{:?}", other))
                    .trim()
            )),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Mapping(self.0)
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace")
    }

    /// `kind/name` reference used by delete
    pub fn reference(&self) -> Option<String> {
        Some(format!("{}/{}", self.kind()?, self.name()?))
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata_map("labels")
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.metadata_map("annotations")
            .and_then(|m| m.get(annotation_key(name).as_str()))
            .and_then(Value::as_str)
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".into(), Value::String(namespace.to_string()));
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        child_map(self.metadata_mut(), "labels").insert(key.into(), value.into());
    }

    pub fn set_annotation(&mut self, name: &str, value: &str) {
        child_map(self.metadata_mut(), "annotations")
            .insert(annotation_key(name).into(), value.into());
    }

    /// Render as a single YAML document
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.0)
    }

    fn metadata_map(&self, key: &str) -> Option<&Mapping> {
        self.0
            .get("metadata")
            .and_then(Value::as_mapping)
            .and_then(|m| m.get(key))
            .and_then(Value::as_mapping)
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(Value::as_mapping)
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
    }

    fn metadata_mut(&mut self) -> &mut Mapping {
        child_map(&mut self.0, "metadata")
    }
}

/// Get or create a nested mapping, replacing non-mapping values
fn child_map<'a>(parent: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let slot = parent
        .entry(Value::String(key.to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !slot.is_mapping() {
        *slot = Value::Mapping(Mapping::new());
    }
    match slot {
        Value::Mapping(map) => map,
        _ => unreachable!("slot was just made a mapping"),
    }
}

/// Parse a YAML document stream into resources
///
/// Empty documents (e.g. produced by a trailing `---`) are skipped. The
/// error string is the parser message.
pub fn parse_documents(stream: &str) -> Result<Vec<Resource>, String> {
    let mut resources = Vec::new();

    for document in serde_yaml::Deserializer::from_str(stream) {
        let value = Value::deserialize(document).map_err(|e| e.to_string())?;
        if value.is_null() {
            continue;
        }
        resources.push(Resource::from_value(value)?);
    }

    Ok(resources)
}

/// Join resources into one YAML document stream
pub fn dump_documents(resources: &[Resource]) -> Result<String, serde_yaml::Error> {
    Ok(resources
        .iter()
        .map(Resource::to_yaml)
        .collect::<Result<Vec<_>, _>>()?
        .join("---\n"))
}
