//! Startup script of the runner container

use crate::crds::GithubActionRunnerPool;
use crate::tasks::types::{Error, Result};
use handlebars::Handlebars;
use kube::ResourceExt;
use serde_json::json;

const ENTRYPOINT_TEMPLATE: &str = include_str!("../../../templates/runner/entrypoint.sh.hbs");

/// Mount point of the volume shared with the build agent
pub const BUILDS_DIR: &str = "/builds";

/// Suffixes of every file the build/deploy signal protocol writes into [`BUILDS_DIR`]
pub const SIGNAL_SUFFIXES: [&str; 7] = [
    ".tar.gz",
    ".dest",
    ".request",
    ".done",
    ".yaml",
    ".apply",
    ".apply-done",
];

/// Render the runner entrypoint for `pool`
pub fn render_entrypoint(pool: &GithubActionRunnerPool) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);

    handlebars
        .register_template_string("runner_entrypoint", ENTRYPOINT_TEMPLATE)
        .map_err(|e| {
            Error::ConfigError(format!(
                "Failed to register runner entrypoint template: {e}"
            ))
        })?;

    let context = json!({
        "pool": pool.name_any(),
        "builds_dir": BUILDS_DIR,
        "signal_suffixes": SIGNAL_SUFFIXES,
        "api_url": pool.api_url(),
        "github_url": pool.github_url(),
        "repository": pool.spec.repository,
        "labels": pool.runner_labels().join(","),
        "work_dir": pool.spec.work_dir,
    });

    handlebars
        .render("runner_entrypoint", &context)
        .map_err(|e| Error::ConfigError(format!("Failed to render runner entrypoint: {e}")))
}
