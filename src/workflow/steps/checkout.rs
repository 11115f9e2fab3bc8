//! The `checkout` step: prepare the git checkout for execution.
//!
//! With the `merge` strategy the base ref is checked out and the head SHA
//! merged without committing, so plans run against the merge result the
//! way the VCS would build it.

use crate::cmd::{self, CommandSpec};
use crate::error::Result;
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

async fn accum(
    state: &RunState,
    output: &mut String,
    argv: &[&str],
) -> Result<bool> {
    let out = cmd::run_capture(state, &CommandSpec::new(argv.to_vec())).await?;
    output.push_str(&out.stdout);
    output.push_str(&out.stderr);
    Ok(out.success())
}

pub async fn run(state: RunState, _step: &Step) -> Result<Outcome> {
    let mut output = String::new();
    let workspace = state.working_dir.display().to_string();

    let setup: [&[&str]; 4] = [
        &["git", "config", "--global", "--add", "safe.directory", &workspace],
        &["git", "config", "--global", "user.email", "hello@terrateam.com"],
        &["git", "config", "--global", "user.name", "Terrateam Action"],
        &["git", "config", "--global", "advice.detachedHead", "false"],
    ];

    for argv in setup {
        if !accum(&state, &mut output, argv).await? {
            return Ok(Outcome::new(
                state,
                "checkout",
                serde_json::json!({ "text": output }),
                false,
            ));
        }
    }

    let strategy = state.repo_config.checkout_strategy().to_string();
    tracing::debug!("CHECKOUT_STRATEGY : {strategy}");

    if strategy == "merge" {
        let base_ref = state
            .work_manifest
            .base_ref
            .clone()
            .unwrap_or_default();
        let sha = state.sha.clone();

        let merge: [&[&str]; 4] = [
            &["git", "branch"],
            &["git", "checkout", &base_ref, "--"],
            &["git", "checkout", "-b", "terrateam/main", &base_ref],
            &["git", "merge", "--no-commit", &sha],
        ];

        for argv in merge {
            if !accum(&state, &mut output, argv).await? {
                return Ok(Outcome::new(
                    state,
                    "checkout",
                    serde_json::json!({ "text": output }),
                    false,
                ));
            }
        }
    }

    Ok(Outcome::new(
        state,
        "checkout",
        serde_json::json!({ "text": output }),
        true,
    ))
}
