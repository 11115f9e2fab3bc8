//! The `apply` step: apply the previously computed plan.

use serde_json::Value;

use crate::engine::{EngineOutput, StepArgs};
use crate::error::Result;
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

/// Shared apply/unsafe-apply tail: collect structured outputs when the
/// engine supports them and fold them into the payload.
pub(crate) async fn finish_apply(
    state: RunState,
    step_name: String,
    apply_out: EngineOutput,
    args: &StepArgs,
) -> Result<Outcome> {
    let engine = super::engine(&state)?;

    let (outputs_success, outputs_stdout, outputs_stderr) =
        match engine.outputs(&state, args).await? {
            Some(out) => (out.success, out.stdout, out.stderr),
            None => (true, "{}".to_string(), String::new()),
        };

    if !outputs_success {
        return Ok(Outcome::new(
            state,
            step_name,
            serde_json::json!({
                "text": format!("{outputs_stderr}\n{outputs_stdout}"),
                "visible_on": "always",
            }),
            false,
        ));
    }

    match serde_json::from_str::<Value>(&outputs_stdout) {
        Ok(outputs) => {
            let mut payload = serde_json::json!({
                "text": apply_out.stdout,
                "visible_on": "always",
            });
            let empty = outputs
                .as_object()
                .map(|o| o.is_empty())
                .unwrap_or(outputs.is_null());
            if !empty {
                payload["outputs"] = outputs;
            }
            Ok(Outcome::new(state, step_name, payload, true))
        }
        Err(e) => Ok(Outcome::new(
            state,
            step_name,
            serde_json::json!({
                "text": format!("{outputs_stderr}\n{outputs_stdout}"),
                "error": e.to_string(),
                "visible_on": "always",
            }),
            false,
        )),
    }
}

pub async fn run(state: RunState, step: &Step) -> Result<Outcome> {
    let engine = super::engine(&state)?;
    let args: StepArgs = step.parse_config()?;
    let step_name = format!("{}/apply", engine.name());

    let out = engine.apply(&state, &args).await?;
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
