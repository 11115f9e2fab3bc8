//! Repo-level configuration (`.terrateam/config.yml`).
//!
//! The file is optional and every field has a default, so resolution logic
//! lives here rather than at the call sites: default plan/apply workflows,
//! engine resolution (including the legacy `terragrunt`/`cdktf`/
//! `terraform_version` workflow keys), hook tables and storage policy.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::workflow::{Step, StepKind};

pub const DEFAULT_PARALLEL_RUNS: usize = 3;
const DEFAULT_TF_VERSION: &str = "latest";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub workflows: Vec<WorkflowConfig>,
    pub hooks: HooksTable,
    pub engine: Option<EngineConfig>,
    pub default_tf_version: Option<String>,
    pub parallel_runs: Option<usize>,
    pub create_and_select_workspace: Option<bool>,
    pub dirs: HashMap<String, DirConfig>,
    pub checkout_strategy: Option<String>,
    pub storage: StorageConfig,
    pub cost_estimation: CostEstimationConfig,
    pub indexer: IndexerConfig,
    pub config_builder: BuilderConfig,
    pub tree_builder: BuilderConfig,
    /// The configuration as parsed, for consumers that need the whole
    /// document (the config-builder script reads it on stdin).
    #[serde(skip)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HooksTable {
    pub all: HookPair,
    pub plan: HookPair,
    pub apply: HookPair,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookPair {
    pub pre: Vec<Step>,
    pub post: Vec<Step>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirConfig {
    pub create_and_select_workspace: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub tag_query: Option<String>,
    pub plan: Option<Vec<Step>>,
    pub apply: Option<Vec<Step>>,
    pub engine: Option<EngineConfig>,
    // Legacy selectors kept for configurations written before `engine`.
    pub terragrunt: bool,
    pub cdktf: bool,
    pub terraform_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    pub version: Option<String>,
    pub tf_version: Option<String>,
    pub tf_cmd: Option<String>,
    pub override_tf_cmd: Option<String>,
    /// Fly engine: the declarative app config file.
    pub config_file: Option<String>,
    // Custom engine: per-operation argv lists; unset operations no-op.
    pub init: Option<Vec<String>>,
    pub plan: Option<Vec<String>>,
    pub diff: Option<Vec<String>>,
    pub apply: Option<Vec<String>>,
    pub unsafe_apply: Option<Vec<String>>,
    pub outputs: Option<Vec<String>>,
}

impl EngineConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Where plan artifacts live between the plan and apply runs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PlanStorage {
    #[default]
    Terrateam,
    Cmd {
        store: Vec<String>,
        fetch: Vec<String>,
        #[serde(default)]
        delete: Option<Vec<String>>,
    },
    S3 {
        bucket: String,
        region: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        #[serde(default)]
        store_extra_args: Vec<String>,
        #[serde(default)]
        fetch_extra_args: Vec<String>,
        #[serde(default)]
        delete_extra_args: Vec<String>,
        #[serde(default = "default_true")]
        delete_used_plans: bool,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub plans: Option<PlanStorage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostEstimationConfig {
    pub enabled: bool,
    pub provider: String,
    pub currency: String,
}

impl Default for CostEstimationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "infracost".to_string(),
            currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub enabled: bool,
    pub build_tag: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            build_tag: "ghcr.io/terrateamio/terrat-code-indexer:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub enabled: bool,
    pub script: Option<String>,
}

/// Per-step retry policy, read from a step's own configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StepRetryConfig {
    pub enabled: bool,
    pub tries: u32,
    pub backoff: f64,
    pub initial_sleep: u64,
}

impl Default for StepRetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tries: 3,
            backoff: 3.0,
            initial_sleep: 5,
        }
    }
}

/// A workflow with every default filled in; what dirspace execution runs.
#[derive(Debug, Clone)]
pub struct ResolvedWorkflow {
    pub plan: Vec<Step>,
    pub apply: Vec<Step>,
    pub engine: EngineConfig,
}

fn default_true() -> bool {
    true
}

fn default_plan_steps() -> Vec<Step> {
    vec![Step::of_type(StepKind::Init), Step::of_type(StepKind::Plan)]
}

fn default_apply_steps() -> Vec<Step> {
    vec![Step::of_type(StepKind::Init), Step::of_type(StepKind::Apply)]
}

impl RepoConfig {
    /// Load the first existing config file from `paths`. A missing or empty
    /// file is an empty configuration, not an error.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<RepoConfig> {
        for path in paths {
            let path = path.as_ref();
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                if content.trim().is_empty() {
                    return Ok(RepoConfig::default());
                }
                let raw: serde_json::Value = serde_yaml::from_str(&content)?;
                let mut config: RepoConfig = serde_json::from_value(raw.clone())?;
                config.raw = raw;
                return Ok(config);
            }
        }

        Ok(RepoConfig::default())
    }

    pub fn parallelism(&self) -> usize {
        self.parallel_runs.unwrap_or(DEFAULT_PARALLEL_RUNS)
    }

    pub fn default_tf_version(&self) -> String {
        self.default_tf_version
            .clone()
            .unwrap_or_else(|| DEFAULT_TF_VERSION.to_string())
    }

    pub fn checkout_strategy(&self) -> &str {
        self.checkout_strategy.as_deref().unwrap_or("merge")
    }

    pub fn plan_storage(&self) -> PlanStorage {
        self.storage.plans.clone().unwrap_or_default()
    }

    pub fn create_and_select_workspace(&self, path: &str) -> bool {
        self.dirs
            .get(path)
            .and_then(|d| d.create_and_select_workspace)
            .or(self.create_and_select_workspace)
            .unwrap_or(true)
    }

    pub fn all_hooks(&self) -> &HookPair {
        &self.hooks.all
    }

    pub fn plan_hooks(&self) -> &HookPair {
        &self.hooks.plan
    }

    pub fn apply_hooks(&self) -> &HookPair {
        &self.hooks.apply
    }

    /// The repo-level engine, with compatibility defaulting: a bare config
    /// gets terraform plus `default_tf_version`, and terragrunt/cdktf get a
    /// terraform `tf_cmd` when none is named.
    pub fn engine(&self) -> EngineConfig {
        match &self.engine {
            Some(engine) => {
                let mut engine = engine.clone();
                if matches!(engine.name.as_str(), "cdktf" | "terragrunt")
                    && engine.tf_cmd.is_none()
                {
                    engine.tf_cmd = Some("terraform".to_string());
                }
                engine
            }
            None => {
                let mut engine = EngineConfig::named("terraform");
                engine.version = self.default_tf_version.clone();
                engine
            }
        }
    }

    pub fn default_workflow(&self) -> Result<ResolvedWorkflow> {
        self.resolve_workflow(&WorkflowConfig::default())
    }

    pub fn workflow(&self, idx: usize) -> Result<ResolvedWorkflow> {
        let workflow = self
            .workflows
            .get(idx)
            .ok_or_else(|| Error::Config(format!("no workflow at index {idx}")))?;
        self.resolve_workflow(workflow)
    }

    fn resolve_workflow(&self, workflow: &WorkflowConfig) -> Result<ResolvedWorkflow> {
        let default_engine = self.engine();

        // Transform legacy workflow keys into an engine configuration, then
        // fill in the lookups later stages would otherwise have to infer.
        let mut engine = match &workflow.engine {
            Some(engine) => engine.clone(),
            None => {
                if workflow.terragrunt {
                    EngineConfig::named("terragrunt")
                } else if workflow.cdktf {
                    EngineConfig::named("cdktf")
                } else if let Some(version) = &workflow.terraform_version {
                    let mut engine = EngineConfig::named("terraform");
                    engine.version = Some(version.clone());
                    engine
                } else {
                    default_engine.clone()
                }
            }
        };

        let (default_tf_cmd, default_tf_version) = if default_engine.name == "tofu" {
            ("tofu", default_engine.version.clone())
        } else {
            ("terraform", None)
        };

        match engine.name.as_str() {
            "terragrunt" | "cdktf" => {
                let tf_cmd = engine
                    .tf_cmd
                    .get_or_insert_with(|| default_tf_cmd.to_string())
                    .clone();
                if engine.tf_version.is_none() {
                    engine.tf_version = if tf_cmd == "terraform" {
                        Some(self.default_tf_version())
                    } else {
                        default_tf_version
                    };
                }
            }
            "terraform" => {
                if engine.version.is_none() {
                    engine.version = Some(self.default_tf_version());
                }
            }
            "tofu" => {
                if engine.version.is_none() {
                    engine.version = default_tf_version;
                }
            }
            "pulumi" | "custom" | "fly" => {}
            other => return Err(Error::UnknownEngine(other.to_string())),
        }

        Ok(ResolvedWorkflow {
            plan: workflow.plan.clone().unwrap_or_else(default_plan_steps),
            apply: workflow.apply.clone().unwrap_or_else(default_apply_steps),
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let rc = RepoConfig::default();
        assert_eq!(rc.parallelism(), 3);
        assert_eq!(rc.engine().name, "terraform");
        assert!(rc.create_and_select_workspace("any/dir"));
        assert_eq!(rc.checkout_strategy(), "merge");
        assert!(matches!(rc.plan_storage(), PlanStorage::Terrateam));

        let wf = rc.default_workflow().unwrap();
        assert_eq!(wf.plan.len(), 2);
        assert_eq!(wf.plan[0].kind, StepKind::Init);
        assert_eq!(wf.plan[1].kind, StepKind::Plan);
        assert_eq!(wf.apply[1].kind, StepKind::Apply);
    }

    #[test]
    fn parses_workflows_and_hooks() {
        let rc: RepoConfig = serde_yaml::from_str(
            r#"
parallel_runs: 5
default_tf_version: 1.5.7
hooks:
  plan:
    pre:
      - type: run
        cmd: ["echo", "before"]
workflows:
  - tag_query: "dir:infra"
    plan:
      - type: init
      - type: plan
        mode: fast-and-loose
"#,
        )
        .unwrap();

        assert_eq!(rc.parallelism(), 5);
        assert_eq!(rc.plan_hooks().pre.len(), 1);
        let wf = rc.workflow(0).unwrap();
        assert_eq!(wf.plan.len(), 2);
        assert_eq!(wf.engine.name, "terraform");
        assert_eq!(wf.engine.version.as_deref(), Some("1.5.7"));
    }

    #[test]
    fn legacy_terragrunt_key_selects_engine() {
        let rc: RepoConfig = serde_yaml::from_str(
            r#"
workflows:
  - terragrunt: true
"#,
        )
        .unwrap();

        let wf = rc.workflow(0).unwrap();
        assert_eq!(wf.engine.name, "terragrunt");
        assert_eq!(wf.engine.tf_cmd.as_deref(), Some("terraform"));
        assert_eq!(wf.engine.tf_version.as_deref(), Some("latest"));
    }

    #[test]
    fn tofu_default_engine_flows_into_terragrunt() {
        let rc: RepoConfig = serde_yaml::from_str(
            r#"
engine:
  name: tofu
  version: 1.9.0
workflows:
  - terragrunt: true
"#,
        )
        .unwrap();

        let wf = rc.workflow(0).unwrap();
        assert_eq!(wf.engine.name, "terragrunt");
        assert_eq!(wf.engine.tf_cmd.as_deref(), Some("tofu"));
        assert_eq!(wf.engine.tf_version.as_deref(), Some("1.9.0"));
    }

    #[test]
    fn unknown_engine_is_fatal() {
        let rc: RepoConfig = serde_yaml::from_str(
            r#"
workflows:
  - engine:
      name: cloudformation
"#,
        )
        .unwrap();

        assert!(matches!(rc.workflow(0), Err(Error::UnknownEngine(_))));
    }

    #[test]
    fn per_dir_workspace_override() {
        let rc: RepoConfig = serde_yaml::from_str(
            r#"
create_and_select_workspace: true
dirs:
  infra/special:
    create_and_select_workspace: false
"#,
        )
        .unwrap();

        assert!(rc.create_and_select_workspace("infra/other"));
        assert!(!rc.create_and_select_workspace("infra/special"));
    }

    #[test]
    fn plan_storage_parses_s3() {
        let rc: RepoConfig = serde_yaml::from_str(
            r#"
storage:
  plans:
    method: s3
    bucket: my-plans
    region: us-east-1
"#,
        )
        .unwrap();

        match rc.plan_storage() {
            PlanStorage::S3 {
                bucket,
                region,
                delete_used_plans,
                ..
            } => {
                assert_eq!(bucket, "my-plans");
                assert_eq!(region, "us-east-1");
                assert!(delete_used_plans);
            }
            other => panic!("unexpected storage: {other:?}"),
        }
    }

    #[test]
    fn load_missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let rc = RepoConfig::load(&[tmp.path().join("config.yml")]).unwrap();
        assert_eq!(rc.parallelism(), 3);
    }
}
