//! Pre/post hooks: workflow steps executed around the directory batch.
//!
//! Hooks run with a restricted step vocabulary; a step type outside it is
//! a configuration error, not a step failure.

use crate::error::Result;
use crate::run_state::RunState;
use crate::workflow::step::run_steps;
use crate::workflow::{Scope, Step};

pub const ALLOWED_HOOK_STEPS: &[&str] = &[
    "drift_create_issue",
    "env",
    "infracost_setup",
    "oidc",
    "run",
    "terrateam_ssh_key_setup",
    "tf_cloud_setup",
];

async fn run_hooks(state: RunState, subflow: &str, steps: &[Step]) -> Result<RunState> {
    run_steps(
        state,
        Scope::hooks(subflow),
        steps,
        Some(ALLOWED_HOOK_STEPS),
    )
    .await
}

pub async fn run_pre_hooks(state: RunState, steps: &[Step]) -> Result<RunState> {
    run_hooks(state, "pre", steps).await
}

pub async fn run_post_hooks(state: RunState, steps: &[Step]) -> Result<RunState> {
    run_hooks(state, "post", steps).await
}
