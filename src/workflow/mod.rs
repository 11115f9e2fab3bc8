//! Workflow step model.
//!
//! A workflow is an ordered list of typed steps run against a mutable run
//! state. Step types form a closed set; CI runtimes may contribute
//! extension steps which ride the [`StepKind::Extension`] variant and are
//! resolved by name at dispatch time.

pub mod step;
pub mod steps;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::run_state::RunState;

pub const RUN_ON_SUCCESS: &str = "success";
pub const RUN_ON_FAILURE: &str = "failure";
pub const RUN_ON_ALWAYS: &str = "always";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunOn {
    #[default]
    Success,
    Failure,
    Always,
}

impl RunOn {
    fn parse(s: &str) -> Result<Self> {
        match s {
            RUN_ON_SUCCESS => Ok(RunOn::Success),
            RUN_ON_FAILURE => Ok(RunOn::Failure),
            RUN_ON_ALWAYS => Ok(RunOn::Always),
            other => Err(Error::Config(format!("invalid run_on: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Init,
    Plan,
    Apply,
    UnsafeApply,
    Run,
    Env,
    Oidc,
    InfracostSetup,
    Checkout,
    TerrateamSshKeySetup,
    TfCloudSetup,
    /// A runtime-contributed step, resolved by name at dispatch time.
    Extension(String),
}

impl StepKind {
    pub fn parse(s: &str) -> StepKind {
        match s {
            "init" => StepKind::Init,
            "plan" => StepKind::Plan,
            "apply" => StepKind::Apply,
            "unsafe_apply" => StepKind::UnsafeApply,
            "run" => StepKind::Run,
            "env" => StepKind::Env,
            "oidc" => StepKind::Oidc,
            "infracost_setup" => StepKind::InfracostSetup,
            "checkout" => StepKind::Checkout,
            "terrateam_ssh_key_setup" => StepKind::TerrateamSshKeySetup,
            "tf_cloud_setup" => StepKind::TfCloudSetup,
            other => StepKind::Extension(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StepKind::Init => "init",
            StepKind::Plan => "plan",
            StepKind::Apply => "apply",
            StepKind::UnsafeApply => "unsafe_apply",
            StepKind::Run => "run",
            StepKind::Env => "env",
            StepKind::Oidc => "oidc",
            StepKind::InfracostSetup => "infracost_setup",
            StepKind::Checkout => "checkout",
            StepKind::TerrateamSshKeySetup => "terrateam_ssh_key_setup",
            StepKind::TfCloudSetup => "tf_cloud_setup",
            StepKind::Extension(name) => name,
        }
    }
}

/// Gate conditions attached to a step's `on_error` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateSpec {
    #[serde(default)]
    pub all_of: Vec<String>,
    #[serde(default)]
    pub any_of: Vec<String>,
    #[serde(default)]
    pub any_of_count: u32,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnError {
    Gate(GateSpec),
}

/// An approval requirement escalated from a failed gated step. Gates do not
/// fail the run; they are hoisted to the top-level result for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub all_of: Vec<String>,
    pub any_of: Vec<String>,
    pub any_of_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

impl Gate {
    pub fn from_spec(spec: &GateSpec, dir: Option<String>, workspace: Option<String>) -> Self {
        Self {
            all_of: spec.all_of.clone(),
            any_of: spec.any_of.clone(),
            any_of_count: spec.any_of_count,
            token: spec.token.clone(),
            name: spec.name.clone(),
            dir,
            workspace,
        }
    }
}

/// A configured workflow step. The full configuration object is kept as
/// data; handlers deserialize the fields they understand.
#[derive(Debug, Clone)]
pub struct Step {
    pub kind: StepKind,
    pub run_on: RunOn,
    pub ignore_errors: bool,
    pub on_error: Vec<OnError>,
    pub config: Value,
}

impl Step {
    pub fn from_value(v: &Value) -> Result<Step> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::Config(format!("step must be an object: {v}")))?;

        let ty = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Config("step must contain a type".to_string()))?;

        let run_on = match obj.get("run_on") {
            Some(Value::String(s)) => RunOn::parse(s)?,
            Some(other) => {
                return Err(Error::Config(format!("invalid run_on: {other}")));
            }
            None => RunOn::Success,
        };

        let ignore_errors = match obj.get("ignore_errors") {
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(Error::Config(format!("invalid ignore_errors: {other}")));
            }
            None => false,
        };

        let on_error = match obj.get("on_error") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::Config(format!("invalid on_error: {e}")))?,
            None => Vec::new(),
        };

        Ok(Step {
            kind: StepKind::parse(ty),
            run_on,
            ignore_errors,
            on_error,
            config: v.clone(),
        })
    }

    /// A bare step of the given type with defaults, for steps assembled in
    /// code (conditional hooks, runtime-injected steps).
    pub fn of_type(kind: StepKind) -> Step {
        let config = serde_json::json!({ "type": kind.name() });
        Step {
            kind,
            run_on: RunOn::Success,
            ignore_errors: false,
            on_error: Vec::new(),
            config,
        }
    }

    /// Deserialize a typed view over this step's configuration.
    pub fn parse_config<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| Error::Config(format!("invalid {} step: {e}", self.kind.name())))
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = Value::deserialize(deserializer)?;
        Step::from_value(&v).map_err(serde::de::Error::custom)
    }
}

/// Where a step ran: inside a directory/workspace, or in a pre/post hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    Run { flow: String, subflow: String },
    Dirspace { dir: String, workspace: String },
}

impl Scope {
    pub fn hooks(subflow: &str) -> Scope {
        Scope::Run {
            flow: "hooks".to_string(),
            subflow: subflow.to_string(),
        }
    }

    pub fn dirspace(dir: &str, workspace: &str) -> Scope {
        Scope::Dirspace {
            dir: dir.to_string(),
            workspace: workspace.to_string(),
        }
    }
}

/// The recorded outcome of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub ignore_errors: bool,
    pub payload: Value,
    pub scope: Scope,
    pub step: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gates: Option<Vec<Gate>>,
}

/// What a step handler returns: the threaded state plus the reported step
/// name, payload and success flag.
#[derive(Debug)]
pub struct Outcome {
    pub state: RunState,
    pub step: String,
    pub payload: Value,
    pub success: bool,
}

impl Outcome {
    pub fn new(state: RunState, step: impl Into<String>, payload: Value, success: bool) -> Self {
        Self {
            state,
            step: step.into(),
            payload,
            success,
        }
    }
}

/// Environment variables exported to every step and child process.
pub mod env_keys {
    pub const PLAN_FILE: &str = "TERRATEAM_PLAN_FILE";
    pub const DIR: &str = "TERRATEAM_DIR";
    pub const WORKSPACE: &str = "TERRATEAM_WORKSPACE";
    pub const TMPDIR: &str = "TERRATEAM_TMPDIR";
    pub const ROOT: &str = "TERRATEAM_ROOT";
    pub const RESULTS_FILE: &str = "TERRATEAM_RESULTS_FILE";
    pub const ENGINE_NAME: &str = "TERRATEAM_ENGINE_NAME";
    pub const TF_CMD: &str = "TERRATEAM_TF_CMD";
    pub const GITHUB_TOKEN: &str = "TERRATEAM_GITHUB_TOKEN";
    pub const RUN_KIND: &str = "TERRATEAM_RUN_KIND";
}

/// Current-dirspace tags for gate records, read from the step environment.
pub fn gate_location(env: &HashMap<String, String>) -> (Option<String>, Option<String>) {
    (
        env.get(env_keys::DIR).cloned(),
        env.get(env_keys::WORKSPACE).cloned(),
    )
}
