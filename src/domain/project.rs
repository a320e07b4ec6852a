//! Project descriptors.
//!
//! A project is a directory holding a `pelton.yaml` descriptor. The
//! descriptor names the project and maps environment names to what each
//! environment builds, renders, watches and depends on.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::activation::{ActivationId, DEFAULT_ENVIRONMENT, DEFAULT_ISOLATION};

/// File name of the descriptor inside a project directory
pub const DESCRIPTOR_FILE: &str = "pelton.yaml";

/// Variables passed to subprocesses as environment variables
pub type Variables = BTreeMap<String, String>;

/// Parsed `pelton.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    /// Project name, also used in namespaces and DNS names
    #[serde(default, alias = "dnsName")]
    pub project_name: String,

    /// Variables shared by every environment
    #[serde(default)]
    pub variables: Variables,

    /// Environment name -> environment spec
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentSpec>,
}

/// What one environment of a project does
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Shell command whose stdout becomes the build result
    #[serde(default, alias = "build", skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,

    /// Shell command printing the environment's resource documents
    #[serde(
        default,
        alias = "printProjectManifest",
        skip_serializing_if = "Option::is_none"
    )]
    pub manifest_render_command: Option<String>,

    /// Shell words (after variable expansion) forming a pod label selector
    #[serde(default, alias = "podSelector", skip_serializing_if = "Option::is_none")]
    pub pod_selector_command: Option<String>,

    /// Ordered dependency declarations
    #[serde(default, alias = "peltonDependencies")]
    pub dependencies: Vec<DependencySpec>,

    /// Environment-level variables, overriding top-level ones
    #[serde(default)]
    pub variables: Variables,

    /// Already-rendered manifest of a synthetic activation created from a
    /// `printProjectManifest` dependency
    #[serde(skip)]
    pub rendered_manifest: Option<String>,
}

/// How to locate (or directly obtain) one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Optional name, used for synthetic manifest activations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub source: DependencySource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<String>,
}

/// Discovery command of a dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DependencySource {
    /// Prints a project directory, relative to the declaring project
    PrintProjectDirectory(String),

    /// Prints a full rendered manifest; the dependency is not a project
    PrintProjectManifest(String),
}

impl DependencySource {
    /// Descriptor key of this source, for error coordinates
    pub fn key(&self) -> &'static str {
        match self {
            Self::PrintProjectDirectory(_) => "printProjectDirectory",
            Self::PrintProjectManifest(_) => "printProjectManifest",
        }
    }

    pub fn command(&self) -> &str {
        match self {
            Self::PrintProjectDirectory(c) | Self::PrintProjectManifest(c) => c,
        }
    }
}

impl DependencySpec {
    pub fn environment(&self) -> &str {
        self.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT)
    }

    pub fn isolation(&self) -> &str {
        self.isolation.as_deref().unwrap_or(DEFAULT_ISOLATION)
    }
}

impl ProjectDescriptor {
    /// Parse descriptor text read from `file`
    pub fn parse(content: &str, file: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| {
            ConfigError::new(format!("Bad descriptor syntax in {}: {}", file.display(), e))
        })
    }

    /// Look up an environment, failing with a configuration error
    pub fn environment(&self, name: &str) -> Result<&EnvironmentSpec, ConfigError> {
        self.environments.get(name).ok_or_else(|| {
            ConfigError::new(format!(
                "Requested environment not defined in \"environments\": {}",
                name
            ))
        })
    }

    /// Top-level variables overlaid with the environment's own
    ///
    /// Unknown environments contribute nothing.
    pub fn variables_for(&self, environment: &str) -> Variables {
        let mut vars = self.variables.clone();
        if let Some(env) = self.environments.get(environment) {
            vars.extend(env.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        vars
    }

    /// Identity of this project activated in `environment`/`isolation`
    pub fn activation(&self, environment: &str, isolation: &str) -> ActivationId {
        ActivationId::new(&self.project_name, environment, isolation)
    }

    /// Descriptor of a dependency that only prints a manifest
    pub fn synthetic(name: &str, environment: &str, manifest: String) -> Self {
        let spec = EnvironmentSpec {
            rendered_manifest: Some(manifest),
            ..Default::default()
        };

        Self {
            project_name: name.to_string(),
            variables: Variables::new(),
            environments: [(environment.to_string(), spec)].into_iter().collect(),
        }
    }
}

/// Path of the descriptor file in a project directory
pub fn descriptor_path(directory: &Path) -> PathBuf {
    directory.join(DESCRIPTOR_FILE)
}

/// One frame of a configuration error chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFrame {
    pub file: PathBuf,
    pub activation: ActivationId,
}

/// Malformed or missing environment/dependency declaration
///
/// Carries the chain of `(descriptor, activation)` frames from the innermost
/// failure out to the root, appended as the walker unwinds.
#[derive(Debug, Clone, Error)]
pub struct ConfigError {
    pub message: String,
    pub frames: Vec<ConfigFrame>,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn append_parent(&mut self, file: impl Into<PathBuf>, activation: ActivationId) {
        self.frames.push(ConfigFrame {
            file: file.into(),
            activation,
        });
    }

    pub fn with_parent(mut self, file: impl Into<PathBuf>, activation: ActivationId) -> Self {
        self.append_parent(file, activation);
        self
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error: {}", self.message)?;
        for frame in &self.frames {
            write!(f, "\n    in {} ({})", frame.file.display(), frame.activation)?;
        }
        Ok(())
    }
}
