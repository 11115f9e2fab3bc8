//! The step state machine.
//!
//! `run_steps` executes an ordered step list against the run state:
//! `run_on` gating, handler dispatch, gate escalation and result
//! recording. Step-level failures never unwind past this function; they
//! become data in the state's outputs. Only configuration errors (unknown
//! step type, type not allowed in this scope) propagate, and they abort
//! the process.

use super::{
    gate_location, Gate, OnError, Outcome, RunOn, Scope, Step, StepKind, StepResult,
};
use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::workflow::steps;

fn step_allowed(step: &Step, state: &RunState, restrict: Option<&[&str]>) -> Result<()> {
    if let StepKind::Extension(name) = &step.kind {
        if !state.runtime.step_names().contains(&name.as_str()) {
            return Err(Error::UnknownStep(name.clone()));
        }
    }

    if let Some(allowed) = restrict {
        if !allowed.contains(&step.kind.name()) {
            return Err(Error::RestrictedStep(step.kind.name().to_string()));
        }
    }

    Ok(())
}

async fn dispatch(state: RunState, step: &Step) -> Result<Outcome> {
    match &step.kind {
        StepKind::Init => steps::init::run(state, step).await,
        StepKind::Plan => steps::plan::run(state, step).await,
        StepKind::Apply => steps::apply::run(state, step).await,
        StepKind::UnsafeApply => steps::unsafe_apply::run(state, step).await,
        StepKind::Run => steps::run::run(state, step).await,
        StepKind::Env => steps::env::run(state, step).await,
        StepKind::Oidc => steps::oidc::run(state, step).await,
        StepKind::InfracostSetup => steps::infracost_setup::run(state, step).await,
        StepKind::Checkout => steps::checkout::run(state, step).await,
        StepKind::TerrateamSshKeySetup => steps::ssh_key_setup::run(state, step).await,
        StepKind::TfCloudSetup => steps::tf_cloud_setup::run(state, step).await,
        StepKind::Extension(name) => {
            let runtime = state.runtime.clone();
            runtime.run_step(name, state, step).await
        }
    }
}

/// Run `steps` in order under `scope`, returning the state with this
/// invocation's results in `outputs` and the sticky success flag updated.
pub async fn run_steps(
    mut state: RunState,
    scope: Scope,
    steps: &[Step],
    restrict: Option<&[&str]>,
) -> Result<RunState> {
    let mut results: Vec<StepResult> = Vec::new();

    for step in steps {
        let runs = match step.run_on {
            RunOn::Always => true,
            RunOn::Failure => !state.success,
            RunOn::Success => state.success,
        };
        if !runs {
            continue;
        }

        step_allowed(step, &state, restrict)?;

        tracing::info!(
            "STEP : RUN : {} : {}",
            state.working_dir.display(),
            step.kind.name()
        );

        let outcome = match dispatch(state.clone(), step).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    "STEP : FAIL : {} : {} : {e}",
                    state.working_dir.display(),
                    step.kind.name()
                );
                Outcome::new(
                    state.clone(),
                    step.kind.name(),
                    serde_json::json!({ "text": e.to_string(), "visible_on": "error" }),
                    false,
                )
            }
        };

        state = outcome.state;

        // A failed step carrying gate conditions escalates into approval
        // gates instead of a hard failure: the step is retroactively
        // ignored and downstream steps keep running.
        let mut ignore_errors = step.ignore_errors;
        let mut gates: Vec<Gate> = Vec::new();
        if !outcome.success && !step.on_error.is_empty() {
            let (dir, workspace) = gate_location(&state.env);
            for on_error in &step.on_error {
                let OnError::Gate(spec) = on_error;
                gates.push(Gate::from_spec(spec, dir.clone(), workspace.clone()));
            }
            ignore_errors = true;
        }

        if !outcome.success && !ignore_errors {
            tracing::error!(
                "STEP : FAIL : {} : {}",
                state.working_dir.display(),
                step.kind.name()
            );
            state.success = false;
        }

        results.push(StepResult {
            ignore_errors,
            payload: outcome.payload,
            scope: scope.clone(),
            step: outcome.step,
            success: outcome.success,
            gates: if gates.is_empty() { None } else { Some(gates) },
        });
    }

    state.outputs = results;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::fixtures;

    fn run_step(cmd: &[&str]) -> Step {
        Step::from_value(&serde_json::json!({
            "type": "run",
            "cmd": cmd,
            "capture_output": true,
            "log_output": false,
        }))
        .unwrap()
    }

    fn step_json(v: serde_json::Value) -> Step {
        Step::from_value(&v).unwrap()
    }

    #[tokio::test]
    async fn records_results_in_order() {
        let state = fixtures::state();
        let steps = vec![run_step(&["echo", "one"]), run_step(&["echo", "two"])];

        let state = run_steps(state, Scope::hooks("pre"), &steps, None)
            .await
            .unwrap();

        assert!(state.success);
        assert_eq!(state.outputs.len(), 2);
        assert!(state.outputs.iter().all(|r| r.success));
        assert_eq!(state.outputs[0].scope, Scope::hooks("pre"));
        assert_eq!(state.outputs[0].step, "run");
    }

    #[tokio::test]
    async fn failure_is_sticky_and_gates_run_on() {
        let state = fixtures::state();
        let steps = vec![
            run_step(&["sh", "-c", "exit 1"]),
            // Skipped: run_on defaults to success.
            run_step(&["echo", "skipped"]),
            // Runs: run_on failure.
            step_json(serde_json::json!({
                "type": "run",
                "cmd": ["echo", "cleanup"],
                "capture_output": true,
                "log_output": false,
                "run_on": "failure",
            })),
        ];

        let state = run_steps(state, Scope::hooks("pre"), &steps, None)
            .await
            .unwrap();

        assert!(!state.success);
        assert_eq!(state.outputs.len(), 2);
        assert!(!state.outputs[0].success);
        assert!(state.outputs[1].success);
    }

    #[tokio::test]
    async fn ignore_errors_does_not_flip_success() {
        let state = fixtures::state();
        let steps = vec![step_json(serde_json::json!({
            "type": "run",
            "cmd": ["sh", "-c", "exit 1"],
            "capture_output": true,
            "log_output": false,
            "ignore_errors": true,
        }))];

        let state = run_steps(state, Scope::hooks("pre"), &steps, None)
            .await
            .unwrap();

        assert!(state.success);
        assert!(!state.outputs[0].success);
        assert!(state.outputs[0].ignore_errors);
    }

    #[tokio::test]
    async fn gate_escalation_never_hard_fails() {
        let mut state = fixtures::state();
        state.insert_env("TERRATEAM_DIR", "infra");
        state.insert_env("TERRATEAM_WORKSPACE", "default");

        let steps = vec![step_json(serde_json::json!({
            "type": "run",
            "cmd": ["sh", "-c", "exit 1"],
            "capture_output": true,
            "log_output": false,
            "on_error": [{"type": "gate", "token": "t1"}],
        }))];

        let state = run_steps(state, Scope::dirspace("infra", "default"), &steps, None)
            .await
            .unwrap();

        assert!(state.success, "gated failure must not fail the run");
        let result = &state.outputs[0];
        assert!(!result.success);
        assert!(result.ignore_errors, "gate escalation sets ignore_errors");
        let gates = result.gates.as_ref().unwrap();
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].token.as_deref(), Some("t1"));
        assert_eq!(gates[0].dir.as_deref(), Some("infra"));
        assert_eq!(gates[0].workspace.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn successful_gated_step_emits_no_gates() {
        let state = fixtures::state();
        let steps = vec![step_json(serde_json::json!({
            "type": "run",
            "cmd": ["echo", "fine"],
            "capture_output": true,
            "log_output": false,
            "on_error": [{"type": "gate", "token": "t1"}],
        }))];

        let state = run_steps(state, Scope::hooks("pre"), &steps, None)
            .await
            .unwrap();

        assert!(state.outputs[0].gates.is_none());
        assert!(!state.outputs[0].ignore_errors);
    }

    #[tokio::test]
    async fn unknown_step_type_is_fatal() {
        let state = fixtures::state();
        let steps = vec![step_json(serde_json::json!({"type": "mystery_step"}))];

        let err = run_steps(state, Scope::hooks("pre"), &steps, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownStep(_)));
    }

    #[tokio::test]
    async fn restricted_step_type_is_fatal() {
        let state = fixtures::state();
        let steps = vec![run_step(&["echo", "hi"])];

        let err = run_steps(state, Scope::hooks("pre"), &steps, Some(&["env"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RestrictedStep(_)));
    }

    #[tokio::test]
    async fn missing_env_var_becomes_a_failed_result() {
        let state = fixtures::state();
        let steps = vec![run_step(&["echo", "${DEFINITELY_NOT_SET}"])];

        let state = run_steps(state, Scope::hooks("pre"), &steps, None)
            .await
            .unwrap();

        assert!(!state.success);
        assert!(!state.outputs[0].success);
        let text = state.outputs[0].payload["text"].as_str().unwrap();
        assert!(text.contains("DEFINITELY_NOT_SET"));
    }
}
