pub mod config;
pub mod container;
pub mod errors;
pub mod hooks;
pub mod key;
pub mod plan;
pub mod provider;

mod executor;
mod graph;
mod registry;
mod scope;

// Re-export commonly used items for convenience
pub use config::{ContainerOptions, ContainerStats};
pub use container::{Container, OverrideGuard};
pub use errors::{BoxError, Error, Result};
pub use hooks::{tracing_hook, HookEvent, HookId};
pub use key::Key;
pub use plan::{PlanExport, PlanStepExport};
pub use provider::{Deps, ProviderInfo, ProviderSpec, Scope, Svc};
