//! The index manifest: run the code indexer over the manifest's
//! directories and send its output to the server.
//!
//! The indexer binary ships in a container image; it is pulled, copied out
//! and executed directly. Every failure path degrades to the default
//! "nothing indexed" document rather than an error.

use serde_json::Value;

use crate::cmd::{self, CommandSpec};
use crate::error::Result;
use crate::run_state::RunState;

fn default_output() -> Value {
    serde_json::json!({ "paths": {}, "version": 1, "success": false })
}

async fn run_indexer(state: &RunState) -> Result<Option<Value>> {
    let build_tag = state.repo_config.indexer.build_tag.clone();

    cmd::run(state, &CommandSpec::new(["apt-get", "update"])).await?;
    cmd::run(
        state,
        &CommandSpec::new(["apt-get", "install", "-y", "docker.io", "musl"]),
    )
    .await?;
    cmd::run(
        state,
        &CommandSpec::new(["docker", "pull", build_tag.as_str()]),
    )
    .await?;

    let created = cmd::run(
        state,
        &CommandSpec::new([
            "docker",
            "create",
            "--name",
            "code-indexer",
            build_tag.as_str(),
        ]),
    )
    .await?;
    if created != Some(0) {
        tracing::error!("Failed to create indexer image");
        return Ok(None);
    }

    let copied = cmd::run(
        state,
        &CommandSpec::new([
            "docker",
            "cp",
            "code-indexer:/usr/local/bin/terrat_code_indexer",
            "/tmp",
        ]),
    )
    .await?;
    if copied != Some(0) {
        tracing::error!("Failed to copy indexer");
        return Ok(None);
    }

    cmd::run(state, &CommandSpec::new(["docker", "rm", "code-indexer"])).await?;

    let mut argv = vec![
        "/tmp/terrat_code_indexer".to_string(),
        "index".to_string(),
    ];
    argv.extend(state.work_manifest.dirs.iter().cloned());

    let out = cmd::run_capture(state, &CommandSpec::new(argv)).await?;
    if !out.success() {
        tracing::error!("Failed to run indexer");
        return Ok(None);
    }

    match serde_json::from_str::<Value>(&out.stdout) {
        Ok(mut parsed) => {
            parsed["success"] = Value::Bool(true);
            Ok(Some(parsed))
        }
        Err(e) => {
            tracing::error!("Failed to decode indexer output: {e}");
            Ok(None)
        }
    }
}

pub async fn run(state: &RunState) -> Result<()> {
    let output = run_indexer(state).await?.unwrap_or_else(default_output);

    state
        .api
        .put_work_manifest(&state.work_token, &output)
        .await?;
    Ok(())
}
