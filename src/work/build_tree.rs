//! The build-tree manifest: run the repo's tree-builder script and send
//! the cleaned-up file tree back to the server.

use serde_json::Value;

use crate::cmd::{self, CommandSpec};
use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::workflow::env_keys;

use super::build_config::write_script;

/// Trees must be repo-relative: strip the repo root and the common
/// absolute/relative prefixes scripts get wrong.
pub(crate) fn cleanup_path(terrateam_root: &str, path: &str) -> String {
    if let Some(rest) = path.strip_prefix(terrateam_root) {
        rest.trim_start_matches('/').to_string()
    } else if let Some(rest) = path.strip_prefix("./") {
        rest.to_string()
    } else if let Some(rest) = path.strip_prefix('/') {
        rest.to_string()
    } else {
        path.to_string()
    }
}

/// Older servers reject trees with unknown or null keys; keep only the
/// fields they accept, dropping nulls.
pub(crate) fn cleanup(terrateam_root: &str, files: &[Value]) -> Vec<Value> {
    files
        .iter()
        .filter_map(|v| {
            let path = v.get("path").and_then(Value::as_str)?;
            let mut entry = serde_json::Map::new();
            entry.insert(
                "path".to_string(),
                Value::String(cleanup_path(terrateam_root, path)),
            );
            if let Some(changed) = v.get("changed") {
                if !changed.is_null() {
                    entry.insert("changed".to_string(), changed.clone());
                }
            }
            if let Some(id) = v.get("id") {
                if !id.is_null() {
                    entry.insert("id".to_string(), id.clone());
                }
            }
            Some(Value::Object(entry))
        })
        .collect()
}

pub async fn run(state: &RunState) -> Result<()> {
    let builder = &state.repo_config.tree_builder;
    if !builder.enabled {
        return Err(Error::Config("tree builder is not enabled".to_string()));
    }
    let script = builder
        .script
        .clone()
        .ok_or_else(|| Error::Config("tree builder has no script".to_string()))?;

    let tmp = tempfile::tempdir()?;
    let script_path = write_script(tmp.path(), "tree-builder", &script).await?;

    let body = match run_builder(state, &script_path, tmp.path()).await {
        Ok(files) => serde_json::json!({ "files": files }),
        Err(e) => {
            tracing::error!("BUILD_TREE : FAIL : {e}");
            serde_json::json!({ "msg": e.to_string() })
        }
    };

    state
        .api
        .put_work_manifest(&state.work_token, &body)
        .await?;
    Ok(())
}

async fn run_builder(
    state: &RunState,
    script_path: &std::path::Path,
    cwd: &std::path::Path,
) -> Result<Vec<Value>> {
    let mut env = std::collections::HashMap::new();
    env.insert(
        "TERRATEAM_BASE_REF".to_string(),
        state.work_manifest.base_ref.clone().unwrap_or_default(),
    );

    let spec = CommandSpec::new([script_path.display().to_string()])
        .cwd(cwd)
        .env(env);

    let out = cmd::run_capture(state, &spec).await?;
    if !out.success() {
        return Err(Error::Other(out.merged()));
    }

    let files: Vec<Value> = serde_json::from_str(&out.stdout)?;
    let root = state
        .env
        .get(env_keys::ROOT)
        .cloned()
        .unwrap_or_default();
    Ok(cleanup(&root, &files))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_common_prefixes() {
        assert_eq!(cleanup_path("/repo", "/repo/infra/main.tf"), "infra/main.tf");
        assert_eq!(cleanup_path("/repo", "./infra/main.tf"), "infra/main.tf");
        assert_eq!(cleanup_path("/repo", "/abs/other.tf"), "abs/other.tf");
        assert_eq!(cleanup_path("/repo", "infra/main.tf"), "infra/main.tf");
    }

    #[test]
    fn drops_null_keys() {
        let files = vec![
            serde_json::json!({"path": "a.tf", "changed": true, "id": null}),
            serde_json::json!({"path": "./b.tf", "changed": null}),
        ];

        let cleaned = cleanup("/repo", &files);
        assert_eq!(
            cleaned[0],
            serde_json::json!({"path": "a.tf", "changed": true})
        );
        assert_eq!(cleaned[1], serde_json::json!({"path": "b.tf"}));
    }
}
