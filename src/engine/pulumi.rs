//! Pulumi.
//!
//! `login`/`stack select` stand in for init, `preview` for plan and
//! `up --yes` for both apply flavors. Pulumi has no plan artifact, so the
//! plan step persists an empty placeholder; there is no diff rendering and
//! no structured outputs retrieval.

use async_trait::async_trait;

use super::{Engine, EngineOutput, PlanOutput, StepArgs};
use crate::cmd::{self, CommandSpec};
use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::workflow::env_keys;

pub struct PulumiEngine;

impl PulumiEngine {
    pub fn new() -> Self {
        Self
    }

    async fn up(&self, state: &RunState) -> Result<EngineOutput> {
        let out = cmd::run_capture(state, &CommandSpec::new(["pulumi", "up", "--yes"])).await?;
        Ok(EngineOutput {
            success: out.success(),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

impl Default for PulumiEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for PulumiEngine {
    fn name(&self) -> &'static str {
        "pulumi"
    }

    async fn init(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("INIT : {}", state.path.as_deref().unwrap_or(""));

        let mut argv = vec!["pulumi".to_string(), "login".to_string()];
        argv.extend(args.extra_args.iter().cloned());

        let login = cmd::run_capture(state, &CommandSpec::new(argv)).await?;
        if !login.success() {
            return Ok(EngineOutput::failed(login.stdout, login.stderr));
        }

        let select = cmd::run_capture(
            state,
            &CommandSpec::new([
                "pulumi".to_string(),
                "stack".to_string(),
                "select".to_string(),
                state.workspace.clone().unwrap_or_default(),
            ]),
        )
        .await?;

        Ok(EngineOutput {
            success: select.success(),
            stdout: select.stdout,
            stderr: select.stderr,
        })
    }

    async fn plan(&self, state: &RunState, args: &StepArgs) -> Result<PlanOutput> {
        tracing::info!("PLAN : {}", state.path.as_deref().unwrap_or(""));

        let mut argv = vec!["pulumi".to_string(), "preview".to_string()];
        argv.extend(args.extra_args.iter().cloned());

        let out = cmd::run_capture(state, &CommandSpec::new(argv)).await?;

        // No plan artifact exists; keep the storage contract satisfied.
        let plan_file = state
            .env
            .get(env_keys::PLAN_FILE)
            .ok_or_else(|| Error::MissingEnvVar(env_keys::PLAN_FILE.to_string()))?;
        tokio::fs::write(plan_file, "{}").await?;

        Ok(PlanOutput {
            success: out.success(),
            has_changes: out.success(),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn diff(&self, _state: &RunState, _args: &StepArgs) -> Result<Option<EngineOutput>> {
        Ok(None)
    }

    async fn apply(&self, state: &RunState, _args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("APPLY : {}", state.path.as_deref().unwrap_or(""));
        self.up(state).await
    }

    async fn unsafe_apply(&self, state: &RunState, _args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("UNSAFE_APPLY : {}", state.path.as_deref().unwrap_or(""));
        self.up(state).await
    }

    async fn outputs(&self, _state: &RunState, _args: &StepArgs) -> Result<Option<EngineOutput>> {
        Ok(None)
    }
}
