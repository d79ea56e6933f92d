//! `GithubActionRunnerPool` reconciliation: runner Deployment, RBAC and the
//! registration lifecycle against the CI platform.

pub mod controller;
pub mod registry;
pub mod resources;
pub mod script;
pub mod state;
pub mod status;

pub use registry::{GithubRunnerApi, RunnerApiError, RunnerRegistry, RunnerToken};
pub use state::RegistrationLedger;
