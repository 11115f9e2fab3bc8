//! Orchestrator-level behavior: pre-hook failure short-circuits directory
//! execution, and gates/secrets flow into the submitted results.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use terrat_runner::api;
use terrat_runner::error::{Error, Result};
use terrat_runner::repo_config::RepoConfig;
use terrat_runner::run_state::RunState;
use terrat_runner::runtime::gitlab::GitlabCi;
use terrat_runner::runtime::RunType;
use terrat_runner::work_exec::{self, DirspaceResult, ExecStrategy};
use terrat_runner::work_manifest::{Dirspace, ManifestKind, WorkManifest};
use terrat_runner::workflow::{Gate, Scope, Step, StepResult};

fn manifest() -> WorkManifest {
    WorkManifest {
        kind: ManifestKind::Plan,
        changed_dirspaces: vec![Dirspace::new("infra", "default", 0)],
        base_dirspaces: Vec::new(),
        dirs: Vec::new(),
        base_ref: Some("main".to_string()),
        result_version: 2,
        token: Some("api-token".to_string()),
        run_kind: Some("pr".to_string()),
        capabilities: Vec::new(),
        config: None,
    }
}

fn state_for(server: &common::TestServer, tmp: &std::path::Path) -> RunState {
    RunState::new(
        Arc::new(api::Client::new(&server.base_url).unwrap()),
        HashMap::new(),
        Arc::new(RepoConfig::default()),
        Arc::new(GitlabCi::new()),
        "deadbeef".to_string(),
        Arc::new(manifest()),
        "work-token".to_string(),
        tmp.to_path_buf(),
    )
}

struct Strategy {
    pre: Vec<Step>,
    exec_calls: AtomicUsize,
    exec_result: Option<(Vec<StepResult>, bool, Vec<String>)>,
}

impl Strategy {
    fn with_failing_pre_hook() -> Self {
        Self {
            pre: vec![Step::from_value(&serde_json::json!({
                "type": "run",
                "cmd": ["sh", "-c", "exit 1"],
                "capture_output": true,
                "log_output": false,
            }))
            .unwrap()],
            exec_calls: AtomicUsize::new(0),
            exec_result: None,
        }
    }

    fn with_exec_outputs(outputs: Vec<StepResult>, success: bool, secrets: Vec<String>) -> Self {
        Self {
            pre: Vec::new(),
            exec_calls: AtomicUsize::new(0),
            exec_result: Some((outputs, success, secrets)),
        }
    }
}

#[async_trait]
impl ExecStrategy for Strategy {
    fn run_type(&self) -> RunType {
        RunType::Plan
    }

    fn pre_hooks(&self, _state: &RunState) -> Result<Vec<Step>> {
        Ok(self.pre.clone())
    }

    fn post_hooks(&self, _state: &RunState) -> Result<Vec<Step>> {
        Ok(Vec::new())
    }

    async fn exec(&self, state: RunState, d: &Dirspace) -> Result<(RunState, DirspaceResult)> {
        self.exec_calls.fetch_add(1, Ordering::SeqCst);

        let (outputs, success, secrets) = self
            .exec_result
            .clone()
            .expect("exec invoked without a configured result");

        let mut state = state;
        for secret in secrets {
            state = state.set_secret(&secret);
        }
        state.success = success;

        Ok((
            state,
            DirspaceResult {
                path: d.path.clone(),
                workspace: d.workspace.clone(),
                success,
                outputs,
            },
        ))
    }
}

#[tokio::test]
async fn pre_hook_failure_short_circuits_directories() {
    let server = common::start().await;
    let tmp = tempfile::tempdir().unwrap();

    let strategy = Arc::new(Strategy::with_failing_pre_hook());
    let err = work_exec::run(state_for(&server, tmp.path()), strategy.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Workflow(_)));
    assert_eq!(
        strategy.exec_calls.load(Ordering::SeqCst),
        0,
        "directories must not execute after pre-hook failure"
    );

    // The submitted results contain only the hook outputs.
    let requests = server.recorded();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "PUT");
    assert_eq!(requests[0].path, "/v1/work-manifests/work-token");

    let steps = requests[0].body["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["success"], serde_json::json!(false));
    assert_eq!(
        steps[0]["scope"],
        serde_json::json!({"type": "run", "flow": "hooks", "subflow": "pre"})
    );
    assert!(requests[0].body.get("gates").is_none());
}

#[tokio::test]
async fn gates_are_hoisted_and_secrets_masked_on_submission() {
    let server = common::start().await;
    let tmp = tempfile::tempdir().unwrap();

    let gate = Gate {
        all_of: Vec::new(),
        any_of: vec!["reviewer".to_string()],
        any_of_count: 1,
        token: Some("gate-token".to_string()),
        name: None,
        dir: Some("infra".to_string()),
        workspace: Some("default".to_string()),
    };

    let outputs = vec![StepResult {
        ignore_errors: true,
        payload: serde_json::json!({ "text": "contains sekret-value here" }),
        scope: Scope::dirspace("infra", "default"),
        step: "run".to_string(),
        success: false,
        gates: Some(vec![gate]),
    }];

    let strategy = Arc::new(Strategy::with_exec_outputs(
        outputs,
        true,
        vec!["sekret-value".to_string()],
    ));

    work_exec::run(state_for(&server, tmp.path()), strategy.clone())
        .await
        .unwrap();

    assert_eq!(strategy.exec_calls.load(Ordering::SeqCst), 1);

    let requests = server.recorded();
    assert_eq!(requests.len(), 1);
    let body = &requests[0].body;

    // Gates moved to the top level and off the steps.
    let gates = body["gates"].as_array().unwrap();
    assert_eq!(gates.len(), 1);
    assert_eq!(gates[0]["token"], serde_json::json!("gate-token"));

    let steps = body["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert!(steps[0].get("gates").is_none());

    // The worker-registered secret is masked in the submitted output.
    let text = steps[0]["payload"]["text"].as_str().unwrap();
    assert_eq!(text, "contains *** here");
}

#[tokio::test]
async fn successful_run_submits_all_dirspace_outputs() {
    let server = common::start().await;
    let tmp = tempfile::tempdir().unwrap();

    let outputs = vec![StepResult {
        ignore_errors: false,
        payload: serde_json::json!({ "text": "plan output", "has_changes": false }),
        scope: Scope::dirspace("infra", "default"),
        step: "tf/plan".to_string(),
        success: true,
        gates: None,
    }];

    let strategy = Arc::new(Strategy::with_exec_outputs(outputs, true, Vec::new()));

    work_exec::run(state_for(&server, tmp.path()), strategy)
        .await
        .unwrap();

    let requests = server.recorded();
    assert_eq!(requests.len(), 1);
    let steps = requests[0].body["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["step"], serde_json::json!("tf/plan"));
    assert!(requests[0].body.get("gates").is_none());
}
