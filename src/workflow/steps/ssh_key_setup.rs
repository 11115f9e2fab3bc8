//! The `terrateam_ssh_key_setup` step.
//!
//! Every `TERRATEAM_SSH_KEY*` environment variable is written into
//! `~/.ssh` with tight permissions and loaded into the agent, and
//! github.com is added to the known hosts.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;

use crate::cmd::{self, CommandSpec};
use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

const STEP_NAME: &str = "tf/terrateam_ssh_key_setup";
const SSH_KEY_NAME_MATCH: &str = "TERRATEAM_SSH_KEY";

pub fn ssh_keys(env: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut keys: Vec<_> = env
        .iter()
        .filter(|(k, _)| k.starts_with(SSH_KEY_NAME_MATCH))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    keys.sort();
    keys
}

async fn setup(state: &RunState) -> Result<()> {
    tracing::info!("TERRATEAM_SSH_KEY : SETUP");

    let ssh_dir = dirs::home_dir()
        .ok_or_else(|| Error::Other("no home directory".to_string()))?
        .join(".ssh");
    tokio::fs::create_dir_all(&ssh_dir).await?;

    for (name, value) in ssh_keys(&state.env) {
        let key_path = ssh_dir.join(&name);
        tokio::fs::write(&key_path, format!("{value}\n")).await?;

        let mut perms = tokio::fs::metadata(&key_path).await?.permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(&key_path, perms).await?;

        let code = cmd::run(
            state,
            &CommandSpec::new(["ssh-add".to_string(), key_path.display().to_string()]),
        )
        .await?;
        if code != Some(0) {
            return Err(Error::Other(format!("ssh-add failed for {name}")));
        }
    }

    let code = cmd::run(
        state,
        &CommandSpec::new(["ssh-keyscan-pre-hook", "github.com"]),
    )
    .await?;
    if code != Some(0) {
        return Err(Error::Other("ssh-keyscan failed".to_string()));
    }

    Ok(())
}

pub async fn run(state: RunState, _step: &Step) -> Result<Outcome> {
    match setup(&state).await {
        Ok(()) => Ok(Outcome::new(
            state,
            STEP_NAME,
            serde_json::json!({
                "text": "Writing TERRATEAM_SSH_KEY.* to ~/.ssh/",
                "visible_on": "error",
            }),
            true,
        )),
        Err(e) => {
            tracing::error!("TERRATEAM_SSH_KEY : FAIL : {e}");
            Ok(Outcome::new(
                state,
                STEP_NAME,
                serde_json::json!({
                    "text": format!("TERRATEAM_SSH_KEY : FAIL : {e}"),
                    "visible_on": "error",
                }),
                false,
            ))
        }
    }
}
