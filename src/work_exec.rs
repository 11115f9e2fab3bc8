//! The per-work-manifest orchestrator.
//!
//! Wires the pieces together for one manifest: engine environment, pre
//! hooks, the dirspace scheduler, post hooks and masked result submission.
//! Pre-hook failure short-circuits directory execution entirely (results
//! carry only the hook outputs); directory failures are folded into the
//! overall success flag but never stop sibling directories; failing to
//! submit results is fatal.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::dir_exec;
use crate::engine;
use crate::error::{Error, Result};
use crate::hooks;
use crate::repo_config::{EngineConfig, RepoConfig};
use crate::results;
use crate::run_state::RunState;
use crate::runtime::RunType;
use crate::work_manifest::Dirspace;
use crate::workflow::{env_keys, Gate, Step, StepResult};

pub const TOFU_DEFAULT_VERSION: &str = "1.9.0";
pub const TERRAFORM_DEFAULT_VERSION: &str = "1.5.7";
pub const TERRAGRUNT_DEFAULT_VERSION: &str = "0.75.3";

const TOFU_ENV_NAME: &str = "TOFUENV_TOFU_DEFAULT_VERSION";
const TERRAFORM_ENV_NAME: &str = "TFENV_TERRAFORM_DEFAULT_VERSION";
const TERRAGRUNT_ENV_NAME: &str = "TG_DEFAULT_VERSION";
const TERRAGRUNT_TF_PATH_ENV_NAME: &str = "TERRAGRUNT_TFPATH";
const TERRAGRUNT_FORWARD_STDOUT1: &str = "TG_TF_FORWARD_STDOUT";
const TERRAGRUNT_FORWARD_STDOUT2: &str = "TERRAGRUNT_FORWARD_TF_STDOUT";

/// The outcome of one dirspace's execution.
#[derive(Debug, Clone, Serialize)]
pub struct DirspaceResult {
    pub path: String,
    pub workspace: String,
    pub success: bool,
    pub outputs: Vec<StepResult>,
}

/// Capability set for one manifest type (plan/apply/unsafe-apply).
#[async_trait]
pub trait ExecStrategy: Send + Sync {
    fn run_type(&self) -> RunType;
    fn pre_hooks(&self, state: &RunState) -> Result<Vec<Step>>;
    fn post_hooks(&self, state: &RunState) -> Result<Vec<Step>>;
    async fn exec(&self, state: RunState, d: &Dirspace) -> Result<(RunState, DirspaceResult)>;
}

/// Find the nearest `.terraform-version` between the working directory and
/// the repo root; fall back to the configured version.
pub fn determine_tf_version(repo_root: &Path, working_dir: &Path, fallback: &str) -> String {
    fn read_version(path: &Path) -> Option<String> {
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }

    let mut path = working_dir.to_path_buf();
    while path != repo_root && path.starts_with(repo_root) {
        if let Some(v) = read_version(&path.join(".terraform-version")) {
            return v;
        }
        if !path.pop() {
            break;
        }
    }

    read_version(&repo_root.join(".terraform-version")).unwrap_or_else(|| fallback.to_string())
}

/// Export the engine selection and version-manager environment the wrapped
/// tools read.
pub fn set_engine_env(
    env: &mut HashMap<String, String>,
    repo_config: &RepoConfig,
    engine: &EngineConfig,
    repo_root: &Path,
    working_dir: &Path,
) {
    env.insert(env_keys::ENGINE_NAME.to_string(), engine.name.clone());

    if matches!(
        engine.name.as_str(),
        "terraform" | "tofu" | "terragrunt" | "cdktf"
    ) {
        env.insert("TF_IN_AUTOMATION".to_string(), "true".to_string());
        env.insert("TF_INPUT".to_string(), "false".to_string());
    }

    let tf_cmd = |default: &str| {
        engine
            .override_tf_cmd
            .clone()
            .unwrap_or_else(|| default.to_string())
    };

    match engine.name.as_str() {
        "tofu" => {
            env.insert(env_keys::TF_CMD.to_string(), tf_cmd("tofu"));
            env.insert(
                TOFU_ENV_NAME.to_string(),
                engine
                    .version
                    .clone()
                    .unwrap_or_else(|| TOFU_DEFAULT_VERSION.to_string()),
            );
        }
        "cdktf" | "terragrunt" => {
            if engine.tf_cmd.as_deref() == Some("tofu") {
                env.insert(env_keys::TF_CMD.to_string(), tf_cmd("tofu"));
                env.insert(
                    TOFU_ENV_NAME.to_string(),
                    engine
                        .tf_version
                        .clone()
                        .unwrap_or_else(|| TOFU_DEFAULT_VERSION.to_string()),
                );
            } else {
                env.insert(env_keys::TF_CMD.to_string(), tf_cmd("terraform"));
                env.insert(
                    TERRAFORM_ENV_NAME.to_string(),
                    engine
                        .tf_version
                        .clone()
                        .unwrap_or_else(|| repo_config.default_tf_version()),
                );
            }

            if engine.name == "terragrunt" {
                // Terragrunt pushes tool output to stderr unless told not to.
                env.insert(TERRAGRUNT_FORWARD_STDOUT1.to_string(), "true".to_string());
                env.insert(TERRAGRUNT_FORWARD_STDOUT2.to_string(), "true".to_string());
                env.insert(
                    TERRAGRUNT_ENV_NAME.to_string(),
                    engine
                        .version
                        .clone()
                        .unwrap_or_else(|| TERRAGRUNT_DEFAULT_VERSION.to_string()),
                );
                let tf_path = env
                    .get(env_keys::TF_CMD)
                    .cloned()
                    .unwrap_or_default();
                env.insert(TERRAGRUNT_TF_PATH_ENV_NAME.to_string(), tf_path);
            }
        }
        "terraform" => {
            env.insert(env_keys::TF_CMD.to_string(), tf_cmd("terraform"));
            let version = engine
                .version
                .clone()
                .unwrap_or_else(|| TERRAFORM_DEFAULT_VERSION.to_string());
            env.insert(
                TERRAFORM_ENV_NAME.to_string(),
                determine_tf_version(repo_root, working_dir, &version),
            );
        }
        _ => {}
    }
}

#[derive(Debug, Serialize)]
struct ResultsDoc {
    steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gates: Option<Vec<Gate>>,
}

/// Mask, version-transform and submit a results document.
async fn store_results(state: &RunState, doc: &ResultsDoc) -> Result<reqwest::Response> {
    let mut unmasked: HashSet<String> = HashSet::new();
    for ds in &state.work_manifest.changed_dirspaces {
        unmasked.insert(ds.path.clone());
        unmasked.insert(ds.workspace.clone());
    }
    for step in &doc.steps {
        unmasked.insert(step.step.clone());
    }

    let value = serde_json::to_value(doc)?;

    let mut secrets: Vec<String> = state.secrets.iter().cloned().collect();
    secrets.extend(results::extract_secrets(state.runtime.as_ref(), &value));
    let secrets = results::sort_secrets(secrets);

    let masked = results::mask_value(&secrets, &unmasked, &value);
    let transformed = results::transform(state.result_version, &masked)?;

    state
        .api
        .put_work_manifest(&state.work_token, &transformed)
        .await
}

fn strip_gates(steps: &mut [StepResult]) {
    for step in steps.iter_mut() {
        step.gates = None;
    }
}

fn drain_gates(steps: &mut [StepResult]) -> Vec<Gate> {
    let mut gates = Vec::new();
    for step in steps.iter_mut() {
        if let Some(step_gates) = step.gates.take() {
            gates.extend(step_gates);
        }
    }
    gates
}

async fn run_inner(mut state: RunState, strategy: Arc<dyn ExecStrategy>) -> Result<RunState> {
    // The hook-level engine environment comes from the repo-level engine;
    // dirspace execution re-derives it from the resolved workflow.
    let engine_config = state.repo_config.engine();
    let repo_config = state.repo_config.clone();
    let repo_root = state.working_dir.clone();
    set_engine_env(
        &mut state.env,
        &repo_config,
        &engine_config,
        &repo_root,
        &repo_root,
    );
    state.engine = Some(engine::from_config(&engine_config)?);

    let tmpdir = state
        .tmpdir
        .clone()
        .ok_or_else(|| Error::Other("orchestrator requires a temp dir".to_string()))?;
    state.insert_env(env_keys::TMPDIR, tmpdir.display().to_string());

    tracing::debug!("EXEC : HOOKS : PRE");
    let pre_hooks = strategy.pre_hooks(&state)?;
    state = hooks::run_pre_hooks(state, &pre_hooks).await?;

    let mut steps = std::mem::take(&mut state.outputs);

    if !state.success {
        // Gates only travel on the top-level result, and a failed pre-hook
        // run has none to report.
        strip_gates(&mut steps);

        let doc = ResultsDoc { steps, gates: None };
        let res = store_results(&state, &doc).await?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(Error::ResultSubmission);
        }
        return Err(Error::Workflow("failed executing pre hooks".to_string()));
    }

    let res = dir_exec::run(
        state.repo_config.parallelism(),
        &state.work_manifest.changed_dirspaces.clone(),
        &state,
        strategy.clone(),
    )
    .await?;

    for (worker_state, result) in res {
        state.success = state.success && worker_state.success;
        state = state.combine_secrets(&worker_state);
        steps.extend(result.outputs);
    }

    tracing::debug!("EXEC : HOOKS : POST");

    // Post hooks can inspect the intermediate results (e.g. drift issue
    // creation), including after directory failures.
    let results_json = tmpdir.join("results.json");
    let intermediate = serde_json::json!({
        "steps": &steps,
        "success": state.success,
    });
    tokio::fs::write(&results_json, serde_json::to_vec(&intermediate)?).await?;
    state.insert_env(env_keys::RESULTS_FILE, results_json.display().to_string());

    let post_hooks = strategy.post_hooks(&state)?;
    state.outputs = Vec::new();
    state = hooks::run_post_hooks(state, &post_hooks).await?;
    steps.extend(std::mem::take(&mut state.outputs));

    let gates = drain_gates(&mut steps);
    let doc = ResultsDoc {
        steps,
        // Omitted entirely when empty, for older servers.
        gates: if gates.is_empty() { None } else { Some(gates) },
    };

    let res = store_results(&state, &doc).await?;
    if res.status() != reqwest::StatusCode::OK {
        tracing::info!("RESPONSE : STATUS_CODE : {}", res.status());
        tracing::info!("RESPONSE : HEADERS : {:?}", res.headers());
        tracing::info!(
            "RESPONSE : CONTENT : {:?}",
            res.text().await.unwrap_or_default()
        );
        return Err(Error::ResultSubmission);
    }

    Ok(state)
}

/// Run one work manifest with the given strategy inside a fresh temp dir.
pub async fn run(mut state: RunState, strategy: Arc<dyn ExecStrategy>) -> Result<RunState> {
    let tmp = tempfile::tempdir()?;
    state.tmpdir = Some(tmp.path().to_path_buf());
    run_inner(state, strategy).await
}

/// Worker-side environment and workflow resolution shared by the drivers.
pub fn bind_dirspace(
    state: &mut RunState,
    d: &Dirspace,
    dirspace_tmp: &Path,
) -> Result<PathBuf> {
    let repo_root = state.working_dir.clone();

    state.outputs = Vec::new();

    let plan_file = dirspace_tmp.join("plan");
    state.insert_env(env_keys::PLAN_FILE, plan_file.display().to_string());
    state.insert_env(env_keys::DIR, d.path.clone());
    state.insert_env(env_keys::WORKSPACE, d.workspace.clone());
    state.insert_env(env_keys::TMPDIR, dirspace_tmp.display().to_string());

    let workflow = match d.workflow_index {
        Some(idx) => state.repo_config.workflow(idx)?,
        None => state.repo_config.default_workflow()?,
    };

    let working_dir = repo_root.join(&d.path);
    let repo_config = state.repo_config.clone();
    set_engine_env(
        &mut state.env,
        &repo_config,
        &workflow.engine,
        &repo_root,
        &working_dir,
    );

    let create_and_select = state.repo_config.create_and_select_workspace(&d.path);
    tracing::info!(
        "EXEC : CREATE_AND_SELECT_WORKSPACE : {} : {}",
        d.path,
        create_and_select
    );
    if workflow.engine.name != "cdktf" && create_and_select {
        state.insert_env("TF_WORKSPACE", d.workspace.clone());
    }

    let fallback_version = workflow
        .engine
        .version
        .clone()
        .or_else(|| workflow.engine.tf_version.clone())
        .unwrap_or_else(|| state.repo_config.default_tf_version());
    state.insert_env(
        "TERRATEAM_TERRAFORM_VERSION",
        determine_tf_version(&repo_root, &working_dir, &fallback_version),
    );

    state.engine = Some(engine::from_config(&workflow.engine)?);
    state.working_dir = working_dir;
    state.path = Some(d.path.clone());
    state.workspace = Some(d.workspace.clone());
    state.workflow = Some(Arc::new(workflow));

    Ok(plan_file)
}

/// A synthetic failed step standing in for work that could not start
/// (e.g. the stored plan could not be fetched).
pub fn synthetic_failure(scope_dir: &str, scope_workspace: &str, text: String) -> StepResult {
    StepResult {
        ignore_errors: false,
        payload: serde_json::json!({ "text": text, "visible_on": "always" }),
        scope: crate::workflow::Scope::dirspace(scope_dir, scope_workspace),
        step: "tf/init".to_string(),
        success: false,
        gates: None,
    }
}
