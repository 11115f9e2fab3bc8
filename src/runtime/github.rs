//! GitHub Actions runtime adapter.
//!
//! Masking and grouping use workflow commands written to stdout
//! (`::add-mask::`, `::group::`). Values and properties are escaped per the
//! Actions toolkit rules before being embedded in a command line.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;

use async_trait::async_trait;
use serde_json::Value;

use super::{drift, RunType, Runtime};
use crate::api;
use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::workflow::{env_keys, Outcome, Step, StepKind};

const MASK_CMD: &str = "::add-mask::";
const UPDATE_TOKEN_STEP: &str = "update_terrateam_github_token";
const DRIFT_STEP: &str = "drift_create_issue";

const ASKPASS_PATH: &str = "/tmp/askpass";

fn escape_data(v: &str) -> String {
    v.replace('%', "%25").replace('\r', "%0D").replace('\n', "%0A")
}

fn escape_property(v: &str) -> String {
    escape_data(v).replace(':', "%3A").replace(',', "%2C")
}

fn issue_cmd(cmd: &str, properties: &[(&str, &str)], msg: &str) {
    let props = if properties.is_empty() {
        String::new()
    } else {
        format!(
            " {}",
            properties
                .iter()
                .map(|(k, v)| format!("{}={}", k, escape_property(v)))
                .collect::<Vec<_>>()
                .join(",")
        )
    };

    println!("::{cmd}{props}::{}", escape_data(msg));
}

pub struct GithubActions;

impl GithubActions {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GithubActions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for GithubActions {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn initialize(&self, mut state: RunState) -> Result<RunState> {
        let git_config = [
            vec![
                "config",
                "--global",
                "credential.https://github.com.username",
                "x-access-token",
            ],
            vec![
                "config",
                "--global",
                "url.https://github.com/.insteadOf",
                "git@github.com:",
            ],
        ];

        for args in git_config {
            let status = tokio::process::Command::new("git")
                .args(&args)
                .status()
                .await?;
            if !status.success() {
                return Err(Error::Config(format!("git {} failed", args.join(" "))));
            }
        }

        let askpass = "#! /usr/bin/env bash\nset -e\nset -u\necho $TERRATEAM_GITHUB_TOKEN\n";
        tokio::fs::write(ASKPASS_PATH, askpass).await?;
        let mut perms = tokio::fs::metadata(ASKPASS_PATH).await?.permissions();
        perms.set_mode(0o555);
        tokio::fs::set_permissions(ASKPASS_PATH, perms).await?;

        state.insert_env("GIT_ASKPASS", ASKPASS_PATH);
        Ok(state)
    }

    fn set_secret(&self, secret: &str) {
        issue_cmd("add-mask", &[], secret);
    }

    fn group_output(&self, title: &str, output: &str) {
        println!("::group::{title}");
        println!("{output}");
        println!("::endgroup::");
    }

    fn is_command(&self, line: &str) -> bool {
        line.starts_with(MASK_CMD)
    }

    fn extract_secrets(&self, text: &str) -> Vec<String> {
        text.lines()
            .filter_map(|l| l.strip_prefix(MASK_CMD))
            .map(str::to_string)
            .collect()
    }

    fn update_workflow_steps(&self, _run_type: RunType, steps: Vec<Step>) -> Vec<Step> {
        let mut updated = vec![Step::of_type(StepKind::Extension(
            UPDATE_TOKEN_STEP.to_string(),
        ))];
        updated.extend(steps);
        updated
    }

    fn step_names(&self) -> Vec<&'static str> {
        vec![UPDATE_TOKEN_STEP, DRIFT_STEP]
    }

    async fn run_step(&self, name: &str, state: RunState, step: &Step) -> Result<Outcome> {
        match name {
            UPDATE_TOKEN_STEP => update_github_token(state, step).await,
            DRIFT_STEP => drift_create_issue(state, step).await,
            other => Err(Error::UnknownStep(other.to_string())),
        }
    }
}

/// Exchange the work-manifest token for a fresh GitHub access token,
/// register it as a secret and expose it to child processes.
async fn update_github_token(state: RunState, _step: &Step) -> Result<Outcome> {
    let api_token = state.api_token.clone().unwrap_or_default();
    let (status, body) = state
        .api
        .access_token(&state.work_token, &api_token)
        .await?;

    if status == reqwest::StatusCode::OK {
        let parsed: Value = serde_json::from_str(&body)?;
        let access_token = parsed
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut state = state.set_secret(&access_token);
        state.insert_env(env_keys::GITHUB_TOKEN, access_token);

        Ok(Outcome::new(
            state,
            "auth/update-terrateam-github-token",
            serde_json::json!({ "visible_on": "error" }),
            true,
        ))
    } else {
        let text = format!("Status {status}\n\n{body}");
        Ok(Outcome::new(
            state,
            "auth/update-terrateam-github-token",
            serde_json::json!({ "text": text, "visible_on": "error" }),
            false,
        ))
    }
}

fn github_api_base(env: &HashMap<String, String>) -> String {
    env.get("GITHUB_API_URL")
        .cloned()
        .unwrap_or_else(|| "https://api.github.com".to_string())
}

async fn find_matching_issue(
    env: &HashMap<String, String>,
    token: &str,
    report_id: &str,
) -> Result<Option<Value>> {
    let repo = env.get("GITHUB_REPOSITORY").cloned().unwrap_or_default();
    let url = format!("{}/repos/{}/issues", github_api_base(env), repo);
    let report_id_line = format!("Report ID: {report_id}");

    let client = reqwest::Client::new();
    let auth = format!("token {token}");
    let res = api::send_with_retry(|| {
        client
            .get(&url)
            .header("User-Agent", "Terrateam Action")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("Authorization", &auth)
    })
    .await?;

    let issues: Value = res.json().await.unwrap_or(Value::Array(Vec::new()));
    if let Some(issues) = issues.as_array() {
        for issue in issues {
            let title = issue.get("title").and_then(Value::as_str).unwrap_or("");
            let body = issue.get("body").and_then(Value::as_str).unwrap_or("");
            if title == drift::TITLE && body.contains(&report_id_line) {
                return Ok(Some(issue.clone()));
            }
        }
    }

    Ok(None)
}

/// Create a drift report issue when a drift run found changes and no open
/// issue already reports them.
async fn drift_create_issue(state: RunState, step: &Step) -> Result<Outcome> {
    fn done(state: RunState) -> Result<Outcome> {
        Ok(Outcome::new(
            state,
            "tf/drift-create-issue",
            serde_json::json!({}),
            true,
        ))
    }

    if state.env.get(env_keys::RUN_KIND).map(String::as_str) != Some("drift") {
        return done(state);
    }

    let Some(results_file) = state.env.get(env_keys::RESULTS_FILE).cloned() else {
        return done(state);
    };
    if !std::path::Path::new(&results_file).is_file() {
        return done(state);
    }

    let dirspaces = drift::extract_dirspace_plans(&results_file)?;
    let with_changes: Vec<_> = dirspaces.into_iter().filter(|d| d.has_changes).collect();
    if with_changes.is_empty() {
        return done(state);
    }

    let output = drift::format_dirspaces(&with_changes);
    let report_id = format!("{:x}", md5::compute(output.as_bytes()));

    // The token handed out at run start may have expired by the time the
    // post hooks run.
    let state = match update_github_token(state, step).await? {
        outcome if outcome.success => outcome.state,
        outcome => return Ok(outcome),
    };

    let token = state
        .env
        .get(env_keys::GITHUB_TOKEN)
        .cloned()
        .unwrap_or_default();

    if let Some(existing) = find_matching_issue(&state.env, &token, &report_id).await? {
        tracing::info!(
            "DRIFT_CREATE_ISSUE : ISSUE_EXISTS : {}",
            existing.get("id").and_then(|v| v.as_i64()).unwrap_or(0)
        );
        return done(state);
    }

    let repo = state
        .env
        .get("GITHUB_REPOSITORY")
        .cloned()
        .unwrap_or_default();
    let url = format!("{}/repos/{}/issues", github_api_base(&state.env), repo);
    let issue = serde_json::json!({
        "title": drift::TITLE,
        "body": drift::format_issue_body(&output, &report_id),
    });

    let client = reqwest::Client::new();
    let auth = format!("token {token}");
    let res = api::send_with_retry(|| {
        client
            .post(&url)
            .header("User-Agent", "Terrateam Action")
            .header("Authorization", &auth)
            .json(&issue)
    })
    .await?;

    if res.status() != reqwest::StatusCode::CREATED {
        let text = res.text().await.unwrap_or_default();
        tracing::error!("Failed to make issue: {text}");
        return Ok(Outcome::new(
            state,
            "tf/drift-create-issue",
            serde_json::json!({ "text": text, "visible_on": "error" }),
            false,
        ));
    }

    done(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_workflow_command_data() {
        assert_eq!(escape_data("a%b\r\nc"), "a%25b%0D%0Ac");
        assert_eq!(escape_property("k:v,w"), "k%3Av%2Cw");
    }

    #[test]
    fn extracts_mask_directives() {
        let rt = GithubActions::new();
        let secrets =
            rt.extract_secrets("line one\n::add-mask::sekret\nline two\n::add-mask::other\n");
        assert_eq!(secrets, vec!["sekret", "other"]);
    }

    #[test]
    fn mask_lines_are_commands() {
        let rt = GithubActions::new();
        assert!(rt.is_command("::add-mask::value"));
        assert!(!rt.is_command("plain output"));
    }

    #[test]
    fn prepends_token_refresh_step() {
        let rt = GithubActions::new();
        let steps = rt.update_workflow_steps(RunType::Plan, vec![Step::of_type(StepKind::Init)]);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].kind.name(), "update_terrateam_github_token");
        assert_eq!(steps[1].kind, StepKind::Init);
    }
}
