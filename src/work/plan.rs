//! The plan manifest driver.

use async_trait::async_trait;

use crate::error::Result;
use crate::run_state::RunState;
use crate::runtime::RunType;
use crate::work_exec::{DirspaceResult, ExecStrategy};
use crate::work_manifest::Dirspace;
use crate::workflow::Step;

pub struct Exec;

#[async_trait]
impl ExecStrategy for Exec {
    fn run_type(&self) -> RunType {
        RunType::Plan
    }

    fn pre_hooks(&self, state: &RunState) -> Result<Vec<Step>> {
        Ok(super::assemble_pre_hooks(
            state,
            state.repo_config.plan_hooks(),
        ))
    }

    fn post_hooks(&self, state: &RunState) -> Result<Vec<Step>> {
        Ok(super::assemble_post_hooks(
            state,
            state.repo_config.plan_hooks(),
        ))
    }

    async fn exec(&self, state: RunState, d: &Dirspace) -> Result<(RunState, DirspaceResult)> {
        super::exec_dirspace(state, d, RunType::Plan, false).await
    }
}
