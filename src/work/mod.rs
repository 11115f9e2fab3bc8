//! Manifest-type drivers.
//!
//! One `ExecStrategy` per workflow manifest type (plan, apply,
//! unsafe-apply) plus the auxiliary manifest types that bypass the
//! orchestrator (index, build-config, build-tree).

pub mod apply;
pub mod build_config;
pub mod build_tree;
pub mod index;
pub mod plan;
pub mod unsafe_apply;

use crate::error::Result;
use crate::plan_store;
use crate::repo_config::HookPair;
use crate::run_state::RunState;
use crate::runtime::RunType;
use crate::work_exec::{self, DirspaceResult};
use crate::work_manifest::Dirspace;
use crate::workflow::step::run_steps;
use crate::workflow::steps::ssh_key_setup::ssh_keys;
use crate::workflow::{Scope, Step, StepKind};

/// all-hooks + environment-conditional setup steps + the type-specific
/// hooks, in that order.
pub(crate) fn assemble_pre_hooks(state: &RunState, specific: &HookPair) -> Vec<Step> {
    let mut steps = state.repo_config.all_hooks().pre.clone();

    if state.env.contains_key("TF_API_TOKEN") {
        steps.push(Step::of_type(StepKind::TfCloudSetup));
    }
    if !ssh_keys(&state.env).is_empty() {
        steps.push(Step::of_type(StepKind::TerrateamSshKeySetup));
    }

    steps.extend(specific.pre.clone());
    steps
}

pub(crate) fn assemble_post_hooks(state: &RunState, specific: &HookPair) -> Vec<Step> {
    let mut steps = state.repo_config.all_hooks().post.clone();
    steps.extend(specific.post.clone());
    steps
}

fn promote_unsafe(step: Step) -> Step {
    if step.kind == StepKind::Apply {
        Step {
            kind: StepKind::UnsafeApply,
            ..step
        }
    } else {
        step
    }
}

/// Execute one dirspace: bind its environment, workflow and engine, load
/// the stored plan when applying, then run the workflow's step list.
pub(crate) async fn exec_dirspace(
    mut state: RunState,
    d: &Dirspace,
    run_type: RunType,
    load_plan: bool,
) -> Result<(RunState, DirspaceResult)> {
    tracing::debug!("EXEC : DIR : {}", d.path);

    let tmp = tempfile::tempdir()?;
    let plan_file = work_exec::bind_dirspace(&mut state, d, tmp.path())?;

    if load_plan {
        let (loaded, err) = plan_store::fetch(
            &state,
            &d.path,
            &d.workspace,
            &plan_file.display().to_string(),
        )
        .await?;

        if !loaded {
            state.success = false;
            let result = DirspaceResult {
                path: d.path.clone(),
                workspace: d.workspace.clone(),
                success: false,
                outputs: vec![work_exec::synthetic_failure(&d.path, &d.workspace, err)],
            };
            return Ok((state, result));
        }
    }

    let workflow = state
        .workflow
        .clone()
        .expect("bind_dirspace sets the workflow");
    let steps = match run_type {
        RunType::Plan => workflow.plan.clone(),
        RunType::Apply => workflow.apply.clone(),
        RunType::UnsafeApply => workflow.apply.iter().cloned().map(promote_unsafe).collect(),
    };
    let steps = state.runtime.update_workflow_steps(run_type, steps);

    let state = run_steps(
        state,
        Scope::dirspace(&d.path, &d.workspace),
        &steps,
        None,
    )
    .await?;

    let result = DirspaceResult {
        path: d.path.clone(),
        workspace: d.workspace.clone(),
        success: state.success,
        outputs: state.outputs.clone(),
    };

    Ok((state, result))
}
