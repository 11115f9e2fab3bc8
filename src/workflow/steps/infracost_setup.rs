//! The `infracost_setup` step: baseline cost breakdown for the base ref.
//!
//! Configures infracost against either the public API (when
//! `INFRACOST_API_KEY` is present) or the server's self-hosted pricing
//! endpoint, checks out the base ref, runs a breakdown over the base
//! dirspaces and restores the working tree. The breakdown JSON is left in
//! the run's temp directory for the cost-estimation integration.

use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::cmd::{self, CommandSpec};
use crate::error::{Error, Result};
use crate::retry;
use crate::run_state::RunState;
use crate::work_manifest::Dirspace;
use crate::workflow::{Outcome, Step};

const STEP_NAME: &str = "tf/cost-estimation";

const INFRACOST_API_KEY: &str = "INFRACOST_API_KEY";
const INFRACOST_CURRENCY: &str = "INFRACOST_CURRENCY";

const TRIES: u32 = 3;
const INITIAL_SLEEP: Duration = Duration::from_secs(2);
const BACKOFF: f64 = 1.5;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct InfracostConfig {
    currency: Option<String>,
}

/// Stable per-dirspace identifier, also the breakdown output filename.
pub fn dirspace_project_name(dirspace: &Dirspace) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{},{}", dirspace.path, dirspace.workspace));
    format!("{:x}", hasher.finalize())
}

/// Multi-project config covering every base dirspace.
pub fn infracost_config_yaml(dirspaces: &[Dirspace]) -> String {
    let projects: Vec<serde_json::Value> = dirspaces
        .iter()
        .map(|d| {
            serde_json::json!({
                "path": d.path,
                "name": dirspace_project_name(d),
                "terraform_workspace": d.workspace,
            })
        })
        .collect();

    serde_yaml::to_string(&serde_json::json!({
        "version": "0.1",
        "projects": projects,
    }))
    .expect("static config shape")
}

async fn run_retry(state: &RunState, argv: Vec<String>) -> Result<cmd::CapturedOutput> {
    let spec = CommandSpec::new(argv);
    let out = retry::run(
        retry::Policy::new(TRIES, INITIAL_SLEEP, BACKOFF),
        || cmd::run_capture(state, &spec),
        |res| match res {
            Ok(out) => out.success() && !out.stdout.contains("level=error"),
            Err(_) => true,
        },
    )
    .await?;

    if !out.success() {
        return Err(Error::Other(format!(
            "command {:?} failed: {}",
            spec.cmd,
            out.merged()
        )));
    }

    Ok(out)
}

async fn configure_infracost(state: &RunState, currency: &str) -> Result<()> {
    if state.env.contains_key(INFRACOST_API_KEY) {
        tracing::info!("INFRACOST : SETUP : PUBLIC_ENDPOINT");
        let key = state.env[INFRACOST_API_KEY].trim().to_string();
        run_retry(
            state,
            vec![
                "infracost".into(),
                "configure".into(),
                "set".into(),
                "api_key".into(),
                key,
            ],
        )
        .await?;
    } else {
        tracing::info!("INFRACOST : SETUP : SELF_HOSTED_ENDPOINT");
        run_retry(
            state,
            vec![
                "infracost".into(),
                "configure".into(),
                "set".into(),
                "pricing_api_endpoint".into(),
                format!("{}/infracost", state.api.base_url()),
            ],
        )
        .await?;
        run_retry(
            state,
            vec![
                "infracost".into(),
                "configure".into(),
                "set".into(),
                "api_key".into(),
                state.work_token.clone(),
            ],
        )
        .await?;
    }

    let currency = state
        .env
        .get(INFRACOST_CURRENCY)
        .cloned()
        .unwrap_or_else(|| currency.to_string());
    run_retry(
        state,
        vec![
            "infracost".into(),
            "configure".into(),
            "set".into(),
            "currency".into(),
            currency,
        ],
    )
    .await?;

    Ok(())
}

async fn git(state: &RunState, args: &[&str]) -> Result<cmd::CapturedOutput> {
    let mut argv = vec!["git".to_string()];
    argv.extend(args.iter().map(|s| s.to_string()));
    cmd::run_capture(state, &CommandSpec::new(argv)).await
}

async fn checkout_base(state: &RunState) -> Result<String> {
    let current = git(state, &["branch", "--show-current"]).await?;
    git(state, &["stash", "push"]).await?;

    let base_ref = state.work_manifest.base_ref.clone().unwrap_or_default();
    let out = git(state, &["checkout", &base_ref, "--"]).await?;
    if !out.success() {
        return Err(Error::Other(format!(
            "could not check out base ref: {}",
            out.merged()
        )));
    }

    Ok(current.stdout.trim().to_string())
}

async fn restore_checkout(state: &RunState, branch: &str) -> Result<()> {
    if !branch.is_empty() {
        let out = git(state, &["checkout", branch, "--"]).await?;
        if !out.success() {
            return Err(Error::Other(format!(
                "could not restore checkout: {}",
                out.merged()
            )));
        }
    }
    git(state, &["stash", "pop"]).await?;
    Ok(())
}

async fn create_base_breakdown(state: &RunState, currency: &str) -> Result<()> {
    configure_infracost(state, currency).await?;

    let tmpdir = state
        .tmpdir
        .clone()
        .ok_or_else(|| Error::Other("no temp directory for this run".to_string()))?;
    let infracost_dir = tmpdir.join("infracost");
    tokio::fs::create_dir_all(&infracost_dir).await?;

    let config_yml = infracost_dir.join("config.yml");
    tokio::fs::write(
        &config_yml,
        infracost_config_yaml(&state.work_manifest.base_dirspaces),
    )
    .await?;

    let prev_json = infracost_dir.join("infracost-prev.json");
    let branch = checkout_base(state).await?;

    let breakdown = run_retry(
        state,
        vec![
            "infracost".into(),
            "breakdown".into(),
            format!("--config-file={}", config_yml.display()),
            "--format=json".into(),
            format!("--out-file={}", prev_json.display()),
        ],
    )
    .await;

    let restore = restore_checkout(state, &branch).await;
    let out = breakdown?;
    restore?;

    for line in out.stdout.lines() {
        tracing::info!("INFRACOST : SETUP : {line}");
    }

    Ok(())
}

pub async fn run(state: RunState, step: &Step) -> Result<Outcome> {
    let config: InfracostConfig = step.parse_config()?;
    let currency = config
        .currency
        .clone()
        .unwrap_or_else(|| state.repo_config.cost_estimation.currency.clone());

    match create_base_breakdown(&state, &currency).await {
        Ok(()) => Ok(Outcome::new(
            state,
            STEP_NAME,
            serde_json::json!({ "text": "", "visible_on": "error" }),
            true,
        )),
        Err(e) => {
            tracing::error!("INFRACOST : SETUP : FAIL : {e}");
            Ok(Outcome::new(
                state,
                STEP_NAME,
                serde_json::json!({ "text": e.to_string(), "visible_on": "error" }),
                false,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names_are_stable_digests() {
        let a = Dirspace::new("infra/prod", "default", 0);
        let b = Dirspace::new("infra/prod", "staging", 0);
        assert_eq!(dirspace_project_name(&a), dirspace_project_name(&a));
        assert_ne!(dirspace_project_name(&a), dirspace_project_name(&b));
        assert_eq!(dirspace_project_name(&a).len(), 64);
    }

    #[test]
    fn config_lists_every_dirspace() {
        let yaml = infracost_config_yaml(&[
            Dirspace::new("infra/prod", "default", 0),
            Dirspace::new("infra/dev", "default", 0),
        ]);

        assert!(yaml.contains("version: '0.1'") || yaml.contains("version: \"0.1\""));
        assert!(yaml.contains("path: infra/prod"));
        assert!(yaml.contains("path: infra/dev"));
        assert!(yaml.contains("terraform_workspace: default"));
    }
}
