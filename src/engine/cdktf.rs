//! CDKTF.
//!
//! CDKTF synthesizes terraform code into `cdktf.out/stacks/<stack>` and the
//! tf operations run inside the synthesized directory. The workspace names
//! the stack; terraform workspace selection is disabled because stacks are
//! already isolated.

use async_trait::async_trait;
use serde_json::Value;

use super::tf::TfEngine;
use super::{Engine, EngineOutput, PlanOutput, StepArgs};
use crate::cmd::{self, CommandSpec};
use crate::error::Result;
use crate::run_state::RunState;

pub struct CdktfEngine {
    inner: TfEngine,
}

impl CdktfEngine {
    pub fn new() -> Self {
        Self {
            inner: TfEngine::new(format!("${{{}}}", crate::workflow::env_keys::TF_CMD), false),
        }
    }

    /// Resolve the synthesized working directory for the current stack from
    /// `cdktf.out/manifest.json`.
    fn stack_working_dir(state: &RunState) -> Result<Option<std::path::PathBuf>> {
        let manifest_path = state.working_dir.join("cdktf.out").join("manifest.json");
        let manifest: Value = serde_json::from_str(&std::fs::read_to_string(manifest_path)?)?;

        let workspace = state.workspace.clone().unwrap_or_default();
        let stack_dir = manifest
            .get("stacks")
            .and_then(|stacks| stacks.get(&workspace))
            .and_then(|stack| stack.get("workingDirectory"))
            .and_then(Value::as_str);

        Ok(stack_dir.map(|dir| state.working_dir.join("cdktf.out").join(dir)))
    }

    /// Rebind the state into the stack directory, or report the missing
    /// stack as an engine failure.
    fn remap(state: &RunState) -> Result<std::result::Result<RunState, EngineOutput>> {
        match Self::stack_working_dir(state)? {
            Some(dir) => {
                let mut remapped = state.clone();
                remapped.working_dir = dir;
                Ok(Ok(remapped))
            }
            None => Ok(Err(EngineOutput::failed(
                "",
                format!(
                    "Stack {} not found",
                    state.workspace.as_deref().unwrap_or("")
                ),
            ))),
        }
    }

    async fn synth(&self, state: &RunState) -> Result<Option<EngineOutput>> {
        for argv in [["cdktf", "get"], ["cdktf", "synth"]] {
            let out = cmd::run_capture(state, &CommandSpec::new(argv)).await?;
            if !out.success() {
                return Ok(Some(EngineOutput::failed(out.stdout, out.stderr)));
            }
        }
        Ok(None)
    }
}

impl Default for CdktfEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for CdktfEngine {
    fn name(&self) -> &'static str {
        "tf"
    }

    async fn init(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        if let Some(failure) = self.synth(state).await? {
            return Ok(failure);
        }

        match Self::remap(state)? {
            Ok(remapped) => self.inner.init(&remapped, args).await,
            Err(failure) => Ok(failure),
        }
    }

    async fn plan(&self, state: &RunState, args: &StepArgs) -> Result<PlanOutput> {
        match Self::remap(state)? {
            Ok(remapped) => self.inner.plan(&remapped, args).await,
            Err(failure) => Ok(PlanOutput::failed(failure.stdout, failure.stderr)),
        }
    }

    async fn diff(&self, state: &RunState, args: &StepArgs) -> Result<Option<EngineOutput>> {
        match Self::remap(state)? {
            Ok(remapped) => self.inner.diff(&remapped, args).await,
            Err(failure) => Ok(Some(failure)),
        }
    }

    async fn apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        match Self::remap(state)? {
            Ok(remapped) => self.inner.apply(&remapped, args).await,
            Err(failure) => Ok(failure),
        }
    }

    async fn unsafe_apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        match Self::remap(state)? {
            Ok(remapped) => self.inner.unsafe_apply(&remapped, args).await,
            Err(failure) => Ok(failure),
        }
    }

    async fn outputs(&self, state: &RunState, args: &StepArgs) -> Result<Option<EngineOutput>> {
        match Self::remap(state)? {
            Ok(remapped) => self.inner.outputs(&remapped, args).await,
            Err(failure) => Ok(Some(failure)),
        }
    }
}
