//! Domain types for pelton.
//!
//! This module contains the core data structures:
//! - Activation: identity of one project instantiation
//! - Project: descriptors, environments and dependency declarations
//! - Resource: rendered cluster documents and their provenance

pub mod activation;
pub mod project;
pub mod resource;

// Re-export commonly used types
pub use activation::{ActivationId, DEFAULT_ENVIRONMENT, DEFAULT_ISOLATION};
pub use project::{
    ConfigError, ConfigFrame, DependencySource, DependencySpec, EnvironmentSpec,
    ProjectDescriptor, Variables,
};
pub use resource::{RenderError, Resource};
