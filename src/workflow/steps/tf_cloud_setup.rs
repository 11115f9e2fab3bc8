//! The `tf_cloud_setup` step: write `~/.terraformrc` from `TF_API_TOKEN`.

use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::workflow::{Outcome, Step};

const STEP_NAME: &str = "tf/tf_cloud_setup";

pub async fn run(state: RunState, _step: &Step) -> Result<Outcome> {
    tracing::info!("TF_CLOUD : SETUP");

    let token = super::env_var(&state, "TF_API_TOKEN")?;
    let terraformrc = dirs::home_dir()
        .ok_or_else(|| Error::Other("no home directory".to_string()))?
        .join(".terraformrc");

    tokio::fs::write(
        &terraformrc,
        format!("credentials \"app.terraform.io\" {{ token = \"{token}\" }}"),
    )
    .await?;

    Ok(Outcome::new(
        state,
        STEP_NAME,
        serde_json::json!({
            "text": "Writing TF_API_TOKEN to ~/.terraformrc",
            "visible_on": "error",
        }),
        true,
    ))
}
