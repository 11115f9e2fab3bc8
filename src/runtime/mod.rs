//! CI runtime adapters.
//!
//! The runner executes inside some CI product (GitHub Actions, GitLab CI).
//! Everything product-specific sits behind this trait: how secrets are
//! masked in the product's own logs, how output is grouped, which output
//! lines are control commands, and which extension steps the product
//! contributes to workflows.

pub mod drift;
pub mod github;
pub mod gitlab;

use async_trait::async_trait;

use crate::error::Result;
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    Plan,
    Apply,
    UnsafeApply,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time process setup (VCS credentials and the like). Runs before
    /// any manifest work.
    async fn initialize(&self, state: RunState) -> Result<RunState>;

    /// Ask the CI product to mask a value in its own log rendering.
    fn set_secret(&self, secret: &str);

    /// Emit a titled, collapsible block of output where the product
    /// supports it.
    fn group_output(&self, title: &str, output: &str);

    /// Whether an output line is a control command for the CI executor and
    /// must be routed to real stdout instead of the log.
    fn is_command(&self, line: &str) -> bool;

    /// Pull masking directives out of captured output.
    fn extract_secrets(&self, text: &str) -> Vec<String>;

    /// Give the runtime a chance to amend the per-directory step list
    /// (e.g. prepending a token refresh).
    fn update_workflow_steps(&self, run_type: RunType, steps: Vec<Step>) -> Vec<Step>;

    /// Names of the extension steps this runtime contributes.
    fn step_names(&self) -> Vec<&'static str>;

    /// Run one of this runtime's extension steps.
    async fn run_step(&self, name: &str, state: RunState, step: &Step) -> Result<Outcome>;
}

pub fn select(name: &str) -> Result<std::sync::Arc<dyn Runtime>> {
    match name {
        "github" => Ok(std::sync::Arc::new(github::GithubActions::new())),
        "gitlab" => Ok(std::sync::Arc::new(gitlab::GitlabCi::new())),
        other => Err(crate::error::Error::Config(format!(
            "unknown runtime: {other}"
        ))),
    }
}
