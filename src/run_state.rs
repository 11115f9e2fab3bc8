//! The execution context threaded through every layer of a run.
//!
//! `RunState` is a value: every holder owns its copy, workers receive
//! clones, and nothing mutates state another holder can see. The
//! orchestrator folds worker-local outcomes (success, secrets, outputs)
//! back into its own copy after each batch.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crate::api;
use crate::engine::Engine;
use crate::repo_config::{RepoConfig, ResolvedWorkflow};
use crate::runtime::Runtime;
use crate::work_manifest::WorkManifest;
use crate::workflow::StepResult;

#[derive(Clone)]
pub struct RunState {
    pub api: Arc<api::Client>,
    /// Bearer token for API calls made on behalf of the work manifest.
    pub api_token: Option<String>,
    /// Engine bound for the current directory; `None` outside a dirspace.
    pub engine: Option<Arc<dyn Engine>>,
    pub env: HashMap<String, String>,
    /// Step results accumulated for the current scope. Reset at every
    /// hook-scope and directory boundary.
    pub outputs: Vec<StepResult>,
    pub path: Option<String>,
    pub repo_config: Arc<RepoConfig>,
    pub result_version: u32,
    pub runtime: Arc<dyn Runtime>,
    pub secrets: BTreeSet<String>,
    pub sha: String,
    pub success: bool,
    pub tmpdir: Option<PathBuf>,
    pub work_manifest: Arc<WorkManifest>,
    pub work_token: String,
    pub workflow: Option<Arc<ResolvedWorkflow>>,
    pub working_dir: PathBuf,
    pub workspace: Option<String>,
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("api", &"<api::Client>")
            .field("api_token", &self.api_token)
            .field("engine", &self.engine.as_ref().map(|_| "<dyn Engine>"))
            .field("env", &self.env)
            .field("outputs", &self.outputs)
            .field("path", &self.path)
            .field("repo_config", &"<RepoConfig>")
            .field("result_version", &self.result_version)
            .field("runtime", &"<dyn Runtime>")
            .field("secrets", &self.secrets)
            .field("sha", &self.sha)
            .field("success", &self.success)
            .field("tmpdir", &self.tmpdir)
            .field("work_manifest", &"<WorkManifest>")
            .field("work_token", &self.work_token)
            .field("workflow", &self.workflow.as_ref().map(|_| "<ResolvedWorkflow>"))
            .field("working_dir", &self.working_dir)
            .field("workspace", &self.workspace)
            .finish()
    }
}

impl RunState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<api::Client>,
        env: HashMap<String, String>,
        repo_config: Arc<RepoConfig>,
        runtime: Arc<dyn Runtime>,
        sha: String,
        work_manifest: Arc<WorkManifest>,
        work_token: String,
        working_dir: PathBuf,
    ) -> Self {
        let api_token = work_manifest.token.clone();
        let result_version = work_manifest.result_version;

        Self {
            api,
            api_token,
            engine: None,
            env,
            outputs: Vec::new(),
            path: None,
            repo_config,
            result_version,
            runtime,
            secrets: BTreeSet::new(),
            sha,
            success: true,
            tmpdir: None,
            work_manifest,
            work_token,
            workflow: None,
            working_dir,
            workspace: None,
        }
    }

    /// Register a secret for redaction, both with the runtime (so the CI
    /// executor masks its own logs) and in the state's secret set.
    pub fn set_secret(mut self, secret: &str) -> Self {
        if !secret.is_empty() {
            self.runtime.set_secret(secret);
            self.secrets.insert(secret.to_string());
        }
        self
    }

    /// Union another state's secrets into this one. Used when folding
    /// worker results back into the orchestrator's aggregate.
    pub fn combine_secrets(mut self, other: &RunState) -> Self {
        self.secrets
            .extend(other.secrets.iter().cloned());
        self
    }

    pub fn insert_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures;

    #[test]
    fn set_secret_ignores_empty_values() {
        let state = fixtures::state().set_secret("");
        assert!(state.secrets.is_empty());

        let state = fixtures::state().set_secret("hunter2");
        assert!(state.secrets.contains("hunter2"));
    }

    #[test]
    fn combine_secrets_unions() {
        let a = fixtures::state().set_secret("one");
        let b = fixtures::state().set_secret("two");

        let combined = a.combine_secrets(&b);
        assert!(combined.secrets.contains("one"));
        assert!(combined.secrets.contains("two"));
    }

    #[test]
    fn clones_do_not_share_mutations() {
        let mut a = fixtures::state();
        let b = a.clone();

        a.insert_env("KEY", "value");
        a.success = false;

        assert!(!b.env.contains_key("KEY"));
        assert!(b.success);
    }
}
