//! The `run` step: an arbitrary user command.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::cmd::{self, CommandSpec};
use crate::error::Result;
use crate::repo_config::StepRetryConfig;
use crate::retry;
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RunConfig {
    cmd: Vec<String>,
    env: HashMap<String, String>,
    capture_output: bool,
    output_key: Option<String>,
    log_output: Option<bool>,
    visible_on: Option<String>,
    retry: StepRetryConfig,
}

pub(crate) struct ExecOutcome {
    pub state: RunState,
    pub success: bool,
    pub text: String,
    pub exit_code: Option<i32>,
}

/// Captured execution with the optional per-step retry policy. Shared by
/// the `run` and `env` steps.
pub(crate) async fn exec_capture(
    state: RunState,
    spec: CommandSpec,
    retry_cfg: &StepRetryConfig,
) -> Result<ExecOutcome> {
    let policy = retry::Policy::new(
        if retry_cfg.enabled { retry_cfg.tries } else { 1 },
        Duration::from_secs(retry_cfg.initial_sleep),
        retry_cfg.backoff,
    );

    let out = retry::run(
        policy,
        || cmd::run_capture(&state, &spec),
        |res| match res {
            Ok(out) => out.success(),
            Err(_) => true,
        },
    )
    .await?;

    let success = out.success();
    let text = if success { out.stdout } else { format!("{}\n{}", out.stderr, out.stdout) };

    Ok(ExecOutcome {
        state,
        success,
        text,
        exit_code: out.exit_code,
    })
}

pub async fn run(state: RunState, step: &Step) -> Result<Outcome> {
    let config: RunConfig = step.parse_config()?;
    let capture = config.capture_output || config.output_key.is_some();
    let log_output = config.log_output.unwrap_or(true);

    let mut payload = serde_json::json!({ "cmd": config.cmd });
    if let Some(visible_on) = &config.visible_on {
        payload["visible_on"] = serde_json::json!(visible_on);
    }

    if capture {
        let spec = CommandSpec::new(config.cmd.clone())
            .env(config.env.clone())
            .log_output(log_output);

        let exec = exec_capture(state, spec, &config.retry).await?;

        payload["text"] = serde_json::json!(exec.text);
        payload["exit_code"] = serde_json::json!(exec.exit_code);
        if let Some(output_key) = &config.output_key {
            payload["output_key"] = serde_json::json!(output_key);
        }

        Ok(Outcome::new(exec.state, "run", payload, exec.success))
    } else {
        let spec = CommandSpec::new(config.cmd.clone())
            .env(config.env.clone())
            .log_output(log_output);

        let code = cmd::run(&state, &spec).await?;
        payload["exit_code"] = serde_json::json!(code);

        Ok(Outcome::new(state, "run", payload, code == Some(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::fixtures;
    use crate::workflow::Step;

    fn step(v: serde_json::Value) -> Step {
        Step::from_value(&v).unwrap()
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let state = fixtures::state();
        let outcome = run(
            state,
            &step(serde_json::json!({
                "type": "run",
                "cmd": ["echo", "captured"],
                "capture_output": true,
                "log_output": false,
            })),
        )
        .await
        .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.step, "run");
        assert_eq!(outcome.payload["text"], "captured\n");
        assert_eq!(outcome.payload["exit_code"], 0);
    }

    #[tokio::test]
    async fn failure_text_includes_stderr() {
        let state = fixtures::state();
        let outcome = run(
            state,
            &step(serde_json::json!({
                "type": "run",
                "cmd": ["sh", "-c", "echo oops >&2; exit 1"],
                "capture_output": true,
                "log_output": false,
            })),
        )
        .await
        .unwrap();

        assert!(!outcome.success);
        assert!(outcome.payload["text"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn retry_reruns_failing_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("attempted");

        // Fails on the first try (marker missing), succeeds on the second.
        let script = format!(
            "if [ -f {marker} ]; then echo done; else touch {marker}; exit 1; fi",
            marker = marker.display()
        );

        let mut state = fixtures::state();
        state.insert_env("PATH", std::env::var("PATH").unwrap_or_default());
        let outcome = run(
            state,
            &step(serde_json::json!({
                "type": "run",
                "cmd": ["sh", "-c", script],
                "capture_output": true,
                "log_output": false,
                "retry": {"enabled": true, "tries": 3, "initial_sleep": 0, "backoff": 1.0},
            })),
        )
        .await
        .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.payload["text"], "done\n");
    }
}
