//! The `plan` step: compute a diff, render it and persist the artifact.

use crate::engine::StepArgs;
use crate::error::Result;
use crate::plan_store;
use crate::run_state::RunState;
use crate::workflow::{env_keys, Outcome, Step};

pub async fn run(state: RunState, step: &Step) -> Result<Outcome> {
    let engine = super::engine(&state)?;
    let args: StepArgs = step.parse_config()?;
    let step_name = format!("{}/plan", engine.name());

    let plan = engine.plan(&state, &args).await?;
    if !plan.success {
        return Ok(Outcome::new(
            state,
            step_name,
            serde_json::json!({ "text": plan.merged(), "visible_on": "always" }),
            false,
        ));
    }

    // Engines without a diff rendering (pulumi) persist an empty one.
    let diff_text = match engine.diff(&state, &args).await? {
        Some(diff) if !diff.success => {
            return Ok(Outcome::new(
                state,
                step_name,
                serde_json::json!({ "text": diff.merged(), "visible_on": "always" }),
                false,
            ));
        }
        Some(diff) => diff.stdout,
        None => String::new(),
    };

    let dir = super::env_var(&state, env_keys::DIR)?;
    let workspace = super::env_var(&state, env_keys::WORKSPACE)?;
    let plan_file = super::env_var(&state, env_keys::PLAN_FILE)?;

    let storage = state.repo_config.plan_storage();
    let (stored, output) = plan_store::store(
        &state,
        &storage,
        &dir,
        &workspace,
        &plan_file,
        plan.has_changes,
    )
    .await?;

    if !stored {
        tracing::error!("PLAN_STORE_FAILED : {dir} : {workspace} : {output}");
        return Ok(Outcome::new(
            state,
            step_name,
            serde_json::json!({
                "text": format!(
                    "Could not store plan file, with the following error:\n\n{output}"
                ),
                "visible_on": "always",
            }),
            false,
        ));
    }

    Ok(Outcome::new(
        state,
        step_name,
        serde_json::json!({
            "plan": diff_text,
            "has_changes": plan.has_changes,
            "text": plan.stdout,
            "visible_on": "always",
        }),
        true,
    ))
}
