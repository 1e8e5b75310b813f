//! Configuration system for the `tomato.yml` file (schema v2).
//!
//! The configuration is a single YAML document. `${VAR}` and `$VAR`
//! references are expanded from the process environment *before* parsing, so
//! secrets and host-specific values never appear in the file itself.
//!
//! Loading applies defaults, then validates structural invariants: the schema
//! version, the reset level, the output format, resource-to-container
//! references, and container dependency references. Graph acyclicity is
//! checked later, at orchestrator construction.

mod loader;
mod types;

pub use loader::{expand_env, expand_env_with, load};
pub use types::{
    AppSpec, BuildSpec, Config, ContainerReset, ContainerSpec, Features, Hook, Hooks, OnFailure,
    ReadyCheck, ResetLevel, ResetSettings, ResourceSpec, Settings, WaitFor,
};

#[cfg(test)]
mod tests;
