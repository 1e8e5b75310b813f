//! Black-box behavioural testing harness.
//!
//! `tomato` executes Gherkin feature files against declared *resources*: it
//! materialises the container infrastructure those resources need, boots
//! the system under test with connection information wired in, dispatches
//! each step to the handler owning the matching pattern, and resets state
//! between scenarios so each begins from a known baseline.
//!
//! # Architecture
//!
//! Four pieces agree on lifecycle, ordering, and failure semantics:
//!
//! - [`orchestrator`]: brings up the declared container dependency graph in
//!   topological order behind readiness gates, and tears it down in
//!   reverse.
//! - [`apprunner`]: launches the system under test (local process or
//!   container) with a templated environment and waits for its health
//!   check.
//! - [`handler`]: one handler per resource, each owning a step vocabulary
//!   and an isolation contract (`init`/`ready`/`reset`/`cleanup`).
//! - [`engine`]: parses features, binds step text to handler actions, and
//!   drives the hook lifecycle and reset policy.
//!
//! # Modules
//!
//! - [`cli`]: command-line surface
//! - [`compare`]: structural JSON matching with `@` matcher tokens
//! - [`config`]: the `tomato.yml` model and loader
//! - [`docs`]: step vocabulary rendering
//! - [`error`]: semantic error taxonomy
//! - [`formatter`]: structured event stream and its renderers
//! - [`probe`]: readiness probes shared by containers and the app
//! - [`runlog`]: per-run artifact directory
//! - [`version`]: version string and update-notice opt-out

pub mod apprunner;
pub mod cli;
pub mod compare;
pub mod config;
pub mod docs;
pub mod engine;
pub mod error;
pub mod formatter;
pub mod handler;
pub mod orchestrator;
pub mod probe;
pub mod runlog;
pub mod version;
