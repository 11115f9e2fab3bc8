//! The `env` step: set environment variables for subsequent steps.
//!
//! `exec` runs a command and binds its output to one variable; `source`
//! runs a shell script through `source` and adopts the resulting
//! environment wholesale. `sensitive` registers the produced values as
//! secrets and suppresses output logging.

use serde::Deserialize;

use crate::cmd::{self, CommandSpec};
use crate::error::{Error, Result};
use crate::repo_config::StepRetryConfig;
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

use super::run::exec_capture;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct EnvConfig {
    cmd: Vec<String>,
    name: Option<String>,
    method: Option<String>,
    sensitive: bool,
    trim_trailing_newlines: Option<bool>,
    retry: StepRetryConfig,
}

async fn run_exec(state: RunState, config: &EnvConfig) -> Result<Outcome> {
    let name = config
        .name
        .clone()
        .ok_or_else(|| Error::Config("env step requires a name".to_string()))?;

    let spec = CommandSpec::new(config.cmd.clone()).log_output(!config.sensitive);
    let exec = exec_capture(state, spec, &config.retry).await?;

    let mut state = exec.state;
    if exec.success {
        let mut value = exec.text.clone();
        if config.trim_trailing_newlines.unwrap_or(true) {
            value = value.trim_end_matches('\n').to_string();
        }

        if config.sensitive {
            state = state.set_secret(&value);
        }

        state.insert_env(name, value);
    }

    let payload = serde_json::json!({
        "cmd": config.cmd,
        "method": "exec",
        "text": exec.text,
    });

    Ok(Outcome::new(state, "env", payload, exec.success))
}

fn source_script(capture_file: &std::path::Path) -> String {
    format!(
        "set -e\nset -u\nsource \"$@\" > {} 2>&1\nenv -0",
        capture_file.display()
    )
}

fn parse_null_separated_env(s: &str) -> std::collections::HashMap<String, String> {
    s.split('\0')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

async fn run_source(state: RunState, config: &EnvConfig) -> Result<Outcome> {
    let capture = tempfile::NamedTempFile::new()?;

    // The extra "bash" after the script is $0 for the -c invocation.
    let mut argv = vec![
        "bash".to_string(),
        "-c".to_string(),
        source_script(capture.path()),
        "bash".to_string(),
    ];
    for c in &config.cmd {
        argv.push(cmd::replace_vars(c, &state.env)?);
    }

    let spec = CommandSpec::new(argv)
        .log_output(!config.sensitive)
        .replace_vars(false);
    let exec = exec_capture(state, spec, &config.retry).await?;

    let sourced_output = std::fs::read_to_string(capture.path())?;
    let mut state = exec.state;
    for line in sourced_output.lines() {
        tracing::info!("cwd={} : {}", state.working_dir.display(), line);
    }

    if exec.success {
        let env = parse_null_separated_env(&exec.text);

        if config.sensitive {
            for (k, v) in &env {
                if state.env.get(k) != Some(v) {
                    state = state.set_secret(v);
                }
            }
        }

        state.env = env;
    }

    let payload = serde_json::json!({
        "cmd": config.cmd,
        "method": "source",
        "text": sourced_output,
    });

    Ok(Outcome::new(state, "env", payload, exec.success))
}

pub async fn run(state: RunState, step: &Step) -> Result<Outcome> {
    let config: EnvConfig = step.parse_config()?;

    match config.method.as_deref().unwrap_or("exec") {
        "exec" => run_exec(state, &config).await,
        "source" => run_source(state, &config).await,
        other => Err(Error::Config(format!("unknown env method: {other}"))),
    }
}
