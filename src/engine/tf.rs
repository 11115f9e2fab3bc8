//! Terraform and OpenTofu.
//!
//! The binary is referenced as `${TERRATEAM_TF_CMD}` so the version-manager
//! shims selected by the engine environment resolve it; the terragrunt
//! engine reuses this implementation with a fixed binary.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::{Engine, EngineOutput, PlanOutput, StepArgs, PLAN_MODE_FAST_AND_LOOSE};
use crate::cmd::{self, CommandSpec};
use crate::error::Result;
use crate::retry;
use crate::run_state::RunState;
use crate::workflow::env_keys;

const INIT_RETRY: retry::Policy =
    retry::Policy::new(3, std::time::Duration::from_secs(1), 1.5);

// Serializes concurrent inits sharing the provider plugin cache.
const INIT_LOCK: &str = "/tmp/tf-init.lock";

static DIFF_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\s+)([+\-~])").unwrap());

/// Hoist unified-diff markers to column 0 and rewrite `~` (update in place)
/// to `!` for display compatibility.
pub fn format_diff(text: &str) -> String {
    DIFF_MARKER_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let marker = match &caps[2] {
                "~" => "!",
                m => m,
            };
            format!("{}{}", marker, &caps[1])
        })
        .into_owned()
}

pub struct TfEngine {
    tf_cmd: String,
    /// CDKTF manages workspaces through stacks; it constructs this engine
    /// with selection disabled.
    select_workspace: bool,
}

impl TfEngine {
    pub fn new(tf_cmd: impl Into<String>, select_workspace: bool) -> Self {
        Self {
            tf_cmd: tf_cmd.into(),
            select_workspace,
        }
    }
}

impl Default for TfEngine {
    fn default() -> Self {
        Self::new(format!("${{{}}}", env_keys::TF_CMD), true)
    }
}

impl TfEngine {
    async fn run_tf(&self, state: &RunState, argv: Vec<String>) -> Result<cmd::CapturedOutput> {
        cmd::run_capture(state, &CommandSpec::new(argv)).await
    }

    async fn select_or_create_workspace(&self, state: &RunState) -> Result<Option<EngineOutput>> {
        let workspace = state.workspace.clone().unwrap_or_default();

        let select = self
            .run_tf(
                state,
                vec![
                    self.tf_cmd.clone(),
                    "workspace".to_string(),
                    "select".to_string(),
                    workspace.clone(),
                ],
            )
            .await?;

        if select.success() {
            return Ok(None);
        }

        let new = self
            .run_tf(
                state,
                vec![
                    self.tf_cmd.clone(),
                    "workspace".to_string(),
                    "new".to_string(),
                    workspace,
                ],
            )
            .await?;

        if new.success() {
            Ok(None)
        } else {
            Ok(Some(EngineOutput::failed(
                format!("{}\n{}", select.stdout, new.stdout),
                format!("{}\n{}", select.stderr, new.stderr),
            )))
        }
    }
}

#[async_trait]
impl Engine for TfEngine {
    fn name(&self) -> &'static str {
        "tf"
    }

    async fn init(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        // A stale local state directory from a previous run on this machine
        // breaks provider resolution; start clean.
        let terraform_dir = state.working_dir.join(".terraform");
        if terraform_dir.exists() {
            tokio::fs::remove_dir_all(&terraform_dir).await?;
        }

        let mut argv = vec![
            "flock".to_string(),
            INIT_LOCK.to_string(),
            self.tf_cmd.clone(),
            "init".to_string(),
        ];
        argv.extend(args.extra_args.iter().cloned());

        let init = retry::run(
            INIT_RETRY,
            || self.run_tf(state, argv.clone()),
            |res| match res {
                Ok(out) => out.success(),
                Err(_) => true,
            },
        )
        .await?;

        if !init.success() {
            return Ok(EngineOutput::failed(init.stdout, init.stderr));
        }

        let select_workspace = self.select_workspace
            && state
                .repo_config
                .create_and_select_workspace(state.path.as_deref().unwrap_or(""));

        tracing::info!(
            "INIT : CREATE_AND_SELECT_WORKSPACE : {} : create_and_select_workspace={}",
            state.path.as_deref().unwrap_or(""),
            select_workspace
        );

        if select_workspace {
            if let Some(failure) = self.select_or_create_workspace(state).await? {
                return Ok(failure);
            }
        }

        Ok(EngineOutput::ok(init.stdout, init.stderr))
    }

    async fn plan(&self, state: &RunState, args: &StepArgs) -> Result<PlanOutput> {
        tracing::info!("PLAN : {}", state.path.as_deref().unwrap_or(""));

        // fast-and-loose first runs a refresh-free JSON plan to narrow the
        // target list, then a full targeted plan. Target extraction is an
        // approximation of "everything that changed", not a guarantee.
        let mut targets = Vec::new();
        if args.mode.as_deref() == Some(PLAN_MODE_FAST_AND_LOOSE) {
            let mut argv = vec![
                self.tf_cmd.clone(),
                "plan".to_string(),
                "-detailed-exitcode".to_string(),
                "-json".to_string(),
                "-refresh=false".to_string(),
            ];
            argv.extend(args.extra_args.iter().cloned());

            let probe = self.run_tf(state, argv).await?;
            match probe.exit_code {
                Some(0) | Some(2) => {
                    for line in probe.stdout.lines() {
                        let Ok(line) = serde_json::from_str::<Value>(line) else {
                            continue;
                        };
                        let ty = line.get("type").and_then(Value::as_str);
                        if matches!(ty, Some("planned_change") | Some("resource_drift")) {
                            if let Some(addr) = line
                                .pointer("/change/resource/addr")
                                .and_then(Value::as_str)
                            {
                                targets.push(format!("-target={addr}"));
                            }
                        }
                    }
                }
                _ => return Ok(PlanOutput::failed(probe.stdout, probe.stderr)),
            }
        }

        let mut argv = vec![
            self.tf_cmd.clone(),
            "plan".to_string(),
            "-detailed-exitcode".to_string(),
            "-out".to_string(),
            format!("${{{}}}", env_keys::PLAN_FILE),
        ];
        argv.extend(targets);
        argv.extend(args.extra_args.iter().cloned());

        let out = self.run_tf(state, argv).await?;
        Ok(PlanOutput {
            success: matches!(out.exit_code, Some(0) | Some(2)),
            has_changes: out.exit_code == Some(2),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn diff(&self, state: &RunState, _args: &StepArgs) -> Result<Option<EngineOutput>> {
        let out = self
            .run_tf(
                state,
                vec![
                    self.tf_cmd.clone(),
                    "show".to_string(),
                    format!("${{{}}}", env_keys::PLAN_FILE),
                ],
            )
            .await?;

        if out.success() {
            Ok(Some(EngineOutput::ok(format_diff(&out.stdout), out.stderr)))
        } else {
            Ok(Some(EngineOutput::failed(out.stdout, out.stderr)))
        }
    }

    async fn apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("APPLY : {}", state.path.as_deref().unwrap_or(""));

        let mut argv = vec![self.tf_cmd.clone(), "apply".to_string()];
        argv.extend(args.extra_args.iter().cloned());
        argv.push(format!("${{{}}}", env_keys::PLAN_FILE));

        let out = self.run_tf(state, argv).await?;
        Ok(EngineOutput {
            success: out.success(),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn unsafe_apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("UNSAFE_APPLY : {}", state.path.as_deref().unwrap_or(""));

        let mut argv = vec![
            self.tf_cmd.clone(),
            "apply".to_string(),
            "-auto-approve".to_string(),
        ];
        argv.extend(args.extra_args.iter().cloned());

        let out = self.run_tf(state, argv).await?;
        Ok(EngineOutput {
            success: out.success(),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn outputs(&self, state: &RunState, _args: &StepArgs) -> Result<Option<EngineOutput>> {
        let out = self
            .run_tf(
                state,
                vec![
                    self.tf_cmd.clone(),
                    "output".to_string(),
                    "-json".to_string(),
                ],
            )
            .await?;

        Ok(Some(EngineOutput {
            success: out.success(),
            stdout: out.stdout,
            stderr: out.stderr,
        }))
    }
}
