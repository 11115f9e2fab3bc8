//! The `init` step: engine initialization for the current directory.

use crate::engine::StepArgs;
use crate::error::Result;
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

pub async fn run(state: RunState, step: &Step) -> Result<Outcome> {
    let engine = super::engine(&state)?;
    let args: StepArgs = step.parse_config()?;

    let out = engine.init(&state, &args).await?;
    let step_name = format!("{}/init", engine.name());

    if !out.success {
        return Ok(Outcome::new(
            state,
            step_name,
            serde_json::json!({ "text": out.merged(), "visible_on": "always" }),
            false,
        ));
    }

    let mut state = state;
    let path = state.path.clone().unwrap_or_default();
    if state.repo_config.create_and_select_workspace(&path) {
        tracing::info!(
            "WORKFLOW_STEP_INIT : CREATE_AND_SELECT_WORKSPACE : {path}"
        );
        if let Some(workspace) = state.workspace.clone() {
            state.insert_env("TF_WORKSPACE", workspace);
        }
    }

    Ok(Outcome::new(
        state,
        step_name,
        serde_json::json!({ "text": out.stdout, "visible_on": "error" }),
        true,
    ))
}
