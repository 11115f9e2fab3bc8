//! Fly.io.
//!
//! Fly has no plan/apply split of its own: plan is a diff of the live app
//! config (`flyctl config show`) against the desired `fly.toml`, rendered
//! as a unified diff and persisted as the plan artifact. Apply is a deploy.

use async_trait::async_trait;
use serde_json::Value;
use similar::TextDiff;

use super::{Engine, EngineOutput, PlanOutput, StepArgs};
use crate::cmd::{self, CommandSpec};
use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::workflow::env_keys;

const DEFAULT_APP_NAME: &str = "${TERRATEAM_WORKSPACE}";

pub struct FlyEngine {
    config_file: String,
    app_name: String,
}

impl FlyEngine {
    pub fn new(config_file: String) -> Self {
        Self {
            config_file,
            app_name: DEFAULT_APP_NAME.to_string(),
        }
    }

    fn config_path(&self, state: &RunState) -> std::path::PathBuf {
        let path = std::path::Path::new(&self.config_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            state.working_dir.join(path)
        }
    }

    fn with_fly_env(&self, state: &RunState) -> RunState {
        let mut state = state.clone();
        state.insert_env("FLY_TOML_PATH", self.config_file.clone());
        state
    }

    fn plan_file(state: &RunState) -> Result<String> {
        state
            .env
            .get(env_keys::PLAN_FILE)
            .cloned()
            .ok_or_else(|| Error::MissingEnvVar(env_keys::PLAN_FILE.to_string()))
    }
}

/// flyctl renders a single mount as a table where the config file uses a
/// list; fold both shapes into a list before comparing.
fn normalize_mounts(config: &mut Value) {
    if let Some(obj) = config.as_object_mut() {
        if let Some(mounts) = obj.get("mounts") {
            if mounts.is_object() {
                let single = mounts.clone();
                obj.insert("mounts".to_string(), Value::Array(vec![single]));
            }
        }
    }
}

/// Render a config value as YAML with sorted keys so live and desired
/// configs compare structurally, not by key order.
fn to_canonical_yaml(value: &Value) -> Result<String> {
    Ok(serde_yaml::to_string(value)?)
}

#[async_trait]
impl Engine for FlyEngine {
    fn name(&self) -> &'static str {
        "fly"
    }

    async fn init(&self, state: &RunState, _args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("INIT : {}", state.path.as_deref().unwrap_or(""));

        let out = cmd::run_capture(
            state,
            &CommandSpec::new([
                "flyctl".to_string(),
                "apps".to_string(),
                "create".to_string(),
                "--name".to_string(),
                self.app_name.clone(),
            ]),
        )
        .await?;

        Ok(EngineOutput {
            success: out.success(),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn plan(&self, state: &RunState, args: &StepArgs) -> Result<PlanOutput> {
        tracing::info!("PLAN : {}", state.path.as_deref().unwrap_or(""));

        let state = self.with_fly_env(state);
        let mut argv = vec![
            "flyctl".to_string(),
            "config".to_string(),
            "show".to_string(),
            "--app".to_string(),
            self.app_name.clone(),
        ];
        argv.extend(args.extra_args.iter().cloned());

        let out = cmd::run_capture(&state, &CommandSpec::new(argv)).await?;
        if !out.success() {
            return Ok(PlanOutput::failed(out.stdout, out.stderr));
        }

        let rendered = (|| -> std::result::Result<(String, String), String> {
            let mut live: Value =
                serde_yaml::from_str(&out.stdout).map_err(|e| e.to_string())?;

            let desired_raw = std::fs::read_to_string(self.config_path(&state))
                .map_err(|e| e.to_string())?;
            let desired_toml: toml::Value =
                toml::from_str(&desired_raw).map_err(|e| e.to_string())?;
            let mut desired =
                serde_json::to_value(desired_toml).map_err(|e| e.to_string())?;

            normalize_mounts(&mut live);
            normalize_mounts(&mut desired);

            let live_yaml = to_canonical_yaml(&live).map_err(|e| e.to_string())?;
            let desired_yaml = to_canonical_yaml(&desired).map_err(|e| e.to_string())?;
            Ok((live_yaml, desired_yaml))
        })();

        match rendered {
            Ok((live_yaml, desired_yaml)) => {
                let text_diff = TextDiff::from_lines(&live_yaml, &desired_yaml);
                let diff = text_diff
                    .unified_diff()
                    .header("live (fly)", &self.config_file)
                    .to_string();

                tokio::fs::write(Self::plan_file(&state)?, &diff).await?;

                Ok(PlanOutput {
                    success: true,
                    has_changes: live_yaml != desired_yaml,
                    stdout: diff,
                    stderr: String::new(),
                })
            }
            Err(err) => Ok(PlanOutput::failed("", err)),
        }
    }

    async fn diff(&self, state: &RunState, _args: &StepArgs) -> Result<Option<EngineOutput>> {
        let content = tokio::fs::read_to_string(Self::plan_file(state)?).await?;
        Ok(Some(EngineOutput::ok(content, "")))
    }

    async fn apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        tracing::info!("APPLY : {}", state.path.as_deref().unwrap_or(""));

        let state = self.with_fly_env(state);
        let mut argv = vec![
            "flyctl".to_string(),
            "deploy".to_string(),
            "--app".to_string(),
            self.app_name.clone(),
        ];
        argv.extend(args.extra_args.iter().cloned());

        let out = cmd::run_capture(&state, &CommandSpec::new(argv)).await?;
        Ok(EngineOutput {
            success: out.success(),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn unsafe_apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput> {
        self.apply(state, args).await
    }

    async fn outputs(&self, _state: &RunState, _args: &StepArgs) -> Result<Option<EngineOutput>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mount_table_becomes_a_list() {
        let mut config = serde_json::json!({
            "app": "web",
            "mounts": {"source": "data", "destination": "/data"}
        });
        normalize_mounts(&mut config);
        assert!(config["mounts"].is_array());
        assert_eq!(config["mounts"][0]["source"], "data");

        // Already a list: untouched.
        let mut config = serde_json::json!({"mounts": [{"source": "data"}]});
        normalize_mounts(&mut config);
        assert_eq!(config["mounts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn canonical_yaml_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(
            to_canonical_yaml(&a).unwrap(),
            to_canonical_yaml(&b).unwrap()
        );
    }
}
