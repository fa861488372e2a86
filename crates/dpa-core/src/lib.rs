//! dpa-core - Core types and collaborator traits for the data plane aggregator
//!
//! This crate holds everything the other crates agree on: the
//! `BackendDescriptor` resource model, the admission/query/discovery wire
//! types, the uniform `Status` error object, and the traits behind which the
//! external collaborators live (resource store, plugin execution backend,
//! plugin-context resolver).

pub mod backend;
pub mod context;
pub mod error;
pub mod models;
pub mod ready;
pub mod routing;
pub mod source;

pub use backend::{
    AdmissionCall, BackendResolver, DataSourceInstance, HealthResult, HealthStatus,
    MutationResult, PluginBackend, PluginContext, PluginContextProvider, QueryCall, ResourceCall,
    ResourceResponse, ValidationResult,
};
pub use context::RequestContext;
pub use error::{BackendError, BackendResult, RegistryError};
pub use models::*;
pub use ready::Readiness;
pub use routing::{GroupVersion, RouteRegistrar};
pub use source::{InMemoryStore, ResourceSource, StatusWriter, WatchEvent};
