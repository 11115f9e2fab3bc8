//! The `unsafe_apply` step: apply with auto-approval and no stored plan.

use crate::engine::StepArgs;
use crate::error::Result;
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

use super::apply::finish_apply;

pub async fn run(state: RunState, step: &Step) -> Result<Outcome> {
    let engine = super::engine(&state)?;
    let args: StepArgs = step.parse_config()?;
    let step_name = format!("{}/apply", engine.name());

    let out = engine.unsafe_apply(&state, &args).await?;
    if !out.success {
        return Ok(Outcome::new(
            state,
            step_name,
            serde_json::json!({ "text": out.merged(), "visible_on": "always" }),
            false,
        ));
    }

    finish_apply(state, step_name, out, &args).await
}
