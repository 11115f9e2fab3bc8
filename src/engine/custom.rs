//! Custom engines.
//!
//! Every operation is an externally configured argv; an unset operation is
//! a no-op success (diff and outputs report "not supported" instead). Plan
//! follows the terraform exit-code family: 0 and 2 both succeed, and a
//! plain 0 reports changes so a configured apply still runs.

use async_trait::async_trait;

use super::{Engine, EngineOutput, PlanOutput, StepArgs};
use crate::cmd::{self, CommandSpec};
use crate::error::Result;
use crate::repo_config::EngineConfig;
use crate::run_state::RunState;

pub struct CustomEngine {
    init_args: Option<Vec<String>>,
    plan_args: Option<Vec<String>>,
    diff_args: Option<Vec<String>>,
    apply_args: Option<Vec<String>>,
    unsafe_apply_args: Option<Vec<String>>,
    outputs_args: Option<Vec<String>>,
}

impl CustomEngine {
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            init_args: engine.init.clone(),
            plan_args: engine.plan.clone(),
            diff_args: engine.diff.clone(),
            apply_args: engine.apply.clone(),
            unsafe_apply_args: engine.unsafe_apply.clone(),
            outputs_args: engine.outputs.clone(),
        }
    }

    async fn run_op(
        &self,
        state: &RunState,
        argv: &Option<Vec<String>>,
        extra_args: &[String],
    ) -> Result<Option<cmd::CapturedOutput>> {
        match argv {
            Some(argv) => {
                let mut full = argv.clone();
                full.extend(extra_args.iter().cloned());
                Ok(Some(cmd::run_capture(state, &CommandSpec::new(full)).await?))
            }
            None => Ok(None),
        }
    }
}

fn trimmed(out: cmd::CapturedOutput) -> EngineOutput {
    EngineOutput {
        success: out.success(),
        stdout: out.stdout.trim().to_string(),
        stderr: out.stderr.trim().to_string(),
    }
}

#[async_trait]
impl Engine for CustomEngine {
    fn name(&self) -> &'static str {
        "custom"
    }

    async fn init(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("INIT : {}", state.path.as_deref().unwrap_or(""));
        match self.run_op(state, &self.init_args, &args.extra_args).await? {
            Some(out) => Ok(trimmed(out)),
            None => Ok(EngineOutput::ok("", "")),
        }
    }

    async fn plan(&self, state: &RunState, args: &StepArgs) -> Result<PlanOutput> {
        tracing::info!("PLAN : {}", state.path.as_deref().unwrap_or(""));
        match self.run_op(state, &self.plan_args, &args.extra_args).await? {
            Some(out) => Ok(PlanOutput {
                success: matches!(out.exit_code, Some(0) | Some(2)),
                has_changes: out.exit_code == Some(0),
                stdout: out.stdout.trim().to_string(),
                stderr: out.stderr.trim().to_string(),
            }),
            None => Ok(PlanOutput {
                success: true,
                has_changes: false,
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }

    async fn diff(&self, state: &RunState, _args: &StepArgs) -> Result<Option<EngineOutput>> {
        match self.run_op(state, &self.diff_args, &[]).await? {
            Some(out) => Ok(Some(trimmed(out))),
            None => Ok(None),
        }
    }

    async fn apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("APPLY : {}", state.path.as_deref().unwrap_or(""));
        match self.run_op(state, &self.apply_args, &args.extra_args).await? {
            Some(out) => Ok(trimmed(out)),
            None => Ok(EngineOutput::ok("", "")),
        }
    }

    async fn unsafe_apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("UNSAFE_APPLY : {}", state.path.as_deref().unwrap_or(""));
        match self
            .run_op(state, &self.unsafe_apply_args, &args.extra_args)
            .await?
        {
            Some(out) => Ok(trimmed(out)),
            None => Ok(EngineOutput::ok("", "")),
        }
    }

    async fn outputs(&self, state: &RunState, _args: &StepArgs) -> Result<Option<EngineOutput>> {
        match self.run_op(state, &self.outputs_args, &[]).await? {
            Some(out) => Ok(Some(trimmed(out))),
            None => Ok(None),
        }
    }
}
