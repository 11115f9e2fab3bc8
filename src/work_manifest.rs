//! The server-issued description of what to do.
//!
//! A work manifest is fetched at process start (and re-fetched until the
//! server answers `done`). Its type selects the orchestrator driver; its
//! dirspaces are the schedulable units of work.

use serde::{Deserialize, Serialize};

/// One unit of schedulable work: a directory path plus a named workspace,
/// with a scheduling rank and an optional index into the repo config's
/// workflow list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dirspace {
    pub path: String,
    pub workspace: String,
    #[serde(default)]
    pub rank: i64,
    #[serde(default, rename = "workflow")]
    pub workflow_index: Option<usize>,
}

impl Dirspace {
    pub fn new(path: impl Into<String>, workspace: impl Into<String>, rank: i64) -> Self {
        Self {
            path: path.into(),
            workspace: workspace.into(),
            rank,
            workflow_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestKind {
    Plan,
    Apply,
    UnsafeApply,
    Index,
    BuildConfig,
    BuildTree,
    Done,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestKind::Plan => "plan",
            ManifestKind::Apply => "apply",
            ManifestKind::UnsafeApply => "unsafe-apply",
            ManifestKind::Index => "index",
            ManifestKind::BuildConfig => "build-config",
            ManifestKind::BuildTree => "build-tree",
            ManifestKind::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkManifest {
    #[serde(rename = "type")]
    pub kind: ManifestKind,
    #[serde(default)]
    pub changed_dirspaces: Vec<Dirspace>,
    #[serde(default)]
    pub base_dirspaces: Vec<Dirspace>,
    /// Directory list handed to the code indexer (index manifests only).
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub base_ref: Option<String>,
    #[serde(default = "default_result_version")]
    pub result_version: u32,
    /// Bearer token for follow-up API calls made on behalf of this manifest.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub run_kind: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

fn default_result_version() -> u32 {
    crate::results::RESULTS_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_plan_manifest() {
        let wm: WorkManifest = serde_json::from_value(serde_json::json!({
            "type": "plan",
            "changed_dirspaces": [
                {"path": "infra/prod", "workspace": "default", "rank": 0, "workflow": 1},
                {"path": "infra/dev", "workspace": "default", "rank": 1}
            ],
            "base_ref": "main",
            "result_version": 2,
            "token": "wm-token",
            "run_kind": "pr"
        }))
        .unwrap();

        assert_eq!(wm.kind, ManifestKind::Plan);
        assert_eq!(wm.changed_dirspaces.len(), 2);
        assert_eq!(wm.changed_dirspaces[0].workflow_index, Some(1));
        assert_eq!(wm.changed_dirspaces[1].workflow_index, None);
        assert_eq!(wm.changed_dirspaces[1].rank, 1);
        assert_eq!(wm.result_version, 2);
    }

    #[test]
    fn kind_uses_kebab_case() {
        let wm: WorkManifest =
            serde_json::from_value(serde_json::json!({"type": "unsafe-apply"})).unwrap();
        assert_eq!(wm.kind, ManifestKind::UnsafeApply);

        let wm: WorkManifest =
            serde_json::from_value(serde_json::json!({"type": "done"})).unwrap();
        assert_eq!(wm.kind, ManifestKind::Done);
    }

    #[test]
    fn result_version_defaults_to_current() {
        let wm: WorkManifest =
            serde_json::from_value(serde_json::json!({"type": "plan"})).unwrap();
        assert_eq!(wm.result_version, crate::results::RESULTS_VERSION);
    }
}
