//! Individual step handlers.
//!
//! Each handler wraps the command executor or the bound engine and returns
//! an [`crate::workflow::Outcome`]. Cross-cutting policy (captured
//! execution, per-step retry, secret registration) lives in the `run`
//! handler's helpers and is reused rather than duplicated per step type.

pub mod apply;
pub mod checkout;
pub mod env;
pub mod infracost_setup;
pub mod init;
pub mod oidc;
pub mod plan;
pub mod run;
pub mod ssh_key_setup;
pub mod tf_cloud_setup;
pub mod unsafe_apply;

use crate::error::{Error, Result};
use crate::run_state::RunState;

/// The engine bound for the current directory; absent outside dirspace
/// execution, which makes engine steps in hooks a configuration error.
pub(crate) fn engine(state: &RunState) -> Result<std::sync::Arc<dyn crate::engine::Engine>> {
    state
        .engine
        .clone()
        .ok_or_else(|| Error::Config("no engine bound for this step".to_string()))
}

pub(crate) fn env_var(state: &RunState, key: &str) -> Result<String> {
    state
        .env
        .get(key)
        .cloned()
        .ok_or_else(|| Error::MissingEnvVar(key.to_string()))
}
