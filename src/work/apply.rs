//! The apply manifest driver: fetch each dirspace's stored plan, then run
//! the apply workflow.

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
        RunType::Apply
    }

    fn pre_hooks(&self, state: &RunState) -> Result<Vec<Step>> {
        Ok(super::assemble_pre_hooks(
            state,
            state.repo_config.apply_hooks(),
        ))
    }

    fn post_hooks(&self, state: &RunState) -> Result<Vec<Step>> {
        Ok(super::assemble_post_hooks(
            state,
            state.repo_config.apply_hooks(),
        ))
    }

    async fn exec(&self, state: RunState, d: &Dirspace) -> Result<(RunState, DirspaceResult)> {
        super::exec_dirspace(state, d, RunType::Apply, true).await
    }
}
