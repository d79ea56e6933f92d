//! `DevStagingEnvironment` reconciliation: one application, its backing
//! services and optional ingress.

pub mod controller;
pub mod resources;
pub mod status;

pub use resources::{plan, EnvironmentPlan};
