//! The IaC engine abstraction.
//!
//! Every supported tool is normalized into one operation contract: `init`,
//! `plan`, `diff`, `apply`, `unsafe_apply`, `outputs`. An engine is bound
//! once per directory from the resolved workflow config and is immutable
//! for the directory's lifetime. `diff` and `outputs` return `None` where
//! the tool has no such concept.

pub mod cdktf;
pub mod custom;
pub mod fly;
pub mod pulumi;
pub mod terragrunt;
pub mod tf;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::repo_config::EngineConfig;
use crate::run_state::RunState;

/// The engine-relevant slice of a step's configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepArgs {
    pub extra_args: Vec<String>,
    pub mode: Option<String>,
}

pub const PLAN_MODE_FAST_AND_LOOSE: &str = "fast-and-loose";

#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl EngineOutput {
    pub fn ok(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// stderr then stdout, for error payloads.
    pub fn merged(&self) -> String {
        format!("{}\n{}", self.stderr, self.stdout)
    }
}

#[derive(Debug, Clone)]
pub struct PlanOutput {
    pub success: bool,
    pub has_changes: bool,
    pub stdout: String,
    pub stderr: String,
}

impl PlanOutput {
    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            has_changes: false,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn merged(&self) -> String {
        format!("{}\n{}", self.stderr, self.stdout)
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// The engine family name used to tag step results (`tf/plan`, ...).
    fn name(&self) -> &'static str;

    async fn init(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput>;
    async fn plan(&self, state: &RunState, args: &StepArgs) -> Result<PlanOutput>;
    async fn diff(&self, state: &RunState, args: &StepArgs) -> Result<Option<EngineOutput>>;
    async fn apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput>;
    async fn unsafe_apply(&self, state: &RunState, args: &StepArgs) -> Result<EngineOutput>;
    async fn outputs(&self, state: &RunState, args: &StepArgs) -> Result<Option<EngineOutput>>;
}

/// Map a resolved engine configuration onto a concrete engine.
pub fn from_config(engine: &EngineConfig) -> Result<Arc<dyn Engine>> {
    match engine.name.as_str() {
        "terraform" | "tofu" => Ok(Arc::new(tf::TfEngine::default())),
        "terragrunt" => Ok(Arc::new(terragrunt::make())),
        "cdktf" => Ok(Arc::new(cdktf::CdktfEngine::new())),
        "pulumi" => Ok(Arc::new(pulumi::PulumiEngine::new())),
        "fly" => {
            let config_file = engine
                .config_file
                .clone()
                .ok_or_else(|| Error::Config("fly engine requires config_file".to_string()))?;
            Ok(Arc::new(fly::FlyEngine::new(config_file)))
        }
        "custom" => Ok(Arc::new(custom::CustomEngine::from_config(engine))),
        other => Err(Error::UnknownEngine(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_engine_names() {
        assert_eq!(
            from_config(&EngineConfig::named("terraform")).unwrap().name(),
            "tf"
        );
        assert_eq!(from_config(&EngineConfig::named("tofu")).unwrap().name(), "tf");
        assert_eq!(
            from_config(&EngineConfig::named("terragrunt")).unwrap().name(),
            "tf"
        );
        assert_eq!(
            from_config(&EngineConfig::named("pulumi")).unwrap().name(),
            "pulumi"
        );
        assert_eq!(
            from_config(&EngineConfig::named("custom")).unwrap().name(),
            "custom"
        );
    }

    #[test]
    fn fly_requires_a_config_file() {
        assert!(matches!(
            from_config(&EngineConfig::named("fly")),
            Err(Error::Config(_))
        ));

        let mut cfg = EngineConfig::named("fly");
        cfg.config_file = Some("fly.toml".to_string());
        assert_eq!(from_config(&cfg).unwrap().name(), "fly");
    }

    #[test]
    fn unknown_engine_is_an_error() {
        assert!(matches!(
            from_config(&EngineConfig::named("cloudformation")),
            Err(Error::UnknownEngine(_))
        ));
    }
}
