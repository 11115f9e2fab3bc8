//! GitLab CI runtime adapter.
//!
//! GitLab has no log-masking or grouping directives, so those are no-ops
//! and grouped output is printed plain. Masking directives emitted by
//! subprocesses are still honored for result redaction.

use async_trait::async_trait;
use serde_json::Value;

use super::{drift, RunType, Runtime};
use crate::api;
use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::workflow::{env_keys, Outcome, Step};

const MASK_CMD: &str = "::add-mask::";
const DRIFT_STEP: &str = "drift_create_issue";

pub struct GitlabCi;

impl GitlabCi {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GitlabCi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for GitlabCi {
    fn name(&self) -> &'static str {
        "gitlab"
    }

    async fn initialize(&self, state: RunState) -> Result<RunState> {
        Ok(state)
    }

    fn set_secret(&self, _secret: &str) {}

    fn group_output(&self, _title: &str, output: &str) {
        println!("{output}");
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
        steps
    }

    fn step_names(&self) -> Vec<&'static str> {
        vec![DRIFT_STEP]
    }

    async fn run_step(&self, name: &str, state: RunState, step: &Step) -> Result<Outcome> {
        match name {
            DRIFT_STEP => drift_create_issue(state, step).await,
            other => Err(Error::UnknownStep(other.to_string())),
        }
    }
}

fn issues_url(state: &RunState) -> String {
    format!(
        "{}/api/v4/projects/{}/issues",
        state.env.get("CI_SERVER_URL").cloned().unwrap_or_default(),
        state.env.get("CI_PROJECT_ID").cloned().unwrap_or_default()
    )
}

fn drift_token(state: &RunState) -> String {
    state
        .env
        .get("TERRATEAM_DRIFT_ACCESS_TOKEN")
        .cloned()
        .unwrap_or_default()
}

async fn find_matching_issue(state: &RunState, report_id: &str) -> Result<Option<Value>> {
    let url = format!(
        "{}?labels=terrateam,drift&state=opened&search={}",
        issues_url(state),
        report_id
    );
    let auth = format!("bearer {}", drift_token(state));

    let client = reqwest::Client::new();
    let res = api::send_with_retry(|| {
        client
            .get(&url)
            .header("User-Agent", "Terrateam Action")
            .header("Authorization", &auth)
    })
    .await?;

    let issues: Value = res.json().await.unwrap_or(Value::Array(Vec::new()));
    Ok(issues.as_array().and_then(|a| a.first().cloned()))
}

fn body_is_too_long(body: &Value) -> bool {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors.iter().any(|err| {
                err.get("message")
                    .and_then(Value::as_str)
                    .map(|m| m.starts_with("body is too long"))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

async fn create_issue(state: &RunState, report_id: &str, issue_body: &str) -> Result<bool> {
    // Progressively smaller bodies if the server rejects the size.
    let fallback = format!(
        "{}\nDrift output too large to display.\n---\nReport ID: {}\n",
        drift::TITLE,
        report_id
    );
    let candidates = [
        issue_body.to_string(),
        drift::compact_issue_body(issue_body),
        fallback,
    ];

    let auth = format!("bearer {}", drift_token(state));
    let url = issues_url(state);
    let client = reqwest::Client::new();

    for body in &candidates {
        let issue = serde_json::json!({
            "title": drift::TITLE,
            "description": body,
            "labels": "terrateam,drift",
        });

        let res = api::send_with_retry(|| {
            client
                .post(&url)
                .header("User-Agent", "Terrateam Action")
                .header("Authorization", &auth)
                .json(&issue)
        })
        .await?;

        let status = res.status();
        if status == reqwest::StatusCode::CREATED {
            tracing::info!("DRIFT_CREATE_ISSUE : SUCCESS");
            return Ok(true);
        }

        let response: Value = res.json().await.unwrap_or(Value::Null);
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY && body_is_too_long(&response) {
            continue;
        }

        tracing::error!("Failed to make issue: {response}");
        return Ok(false);
    }

    Ok(false)
}

async fn drift_create_issue(state: RunState, _step: &Step) -> Result<Outcome> {
    fn done(state: RunState, success: bool) -> Result<Outcome> {
        Ok(Outcome::new(
            state,
            "tf/drift-create-issue",
            serde_json::json!({}),
            success,
        ))
    }

    if state.env.get(env_keys::RUN_KIND).map(String::as_str) != Some("drift") {
        return done(state, true);
    }

    let Some(results_file) = state.env.get(env_keys::RESULTS_FILE).cloned() else {
        return done(state, true);
    };
    if !std::path::Path::new(&results_file).is_file() {
        return done(state, true);
    }

    let dirspaces = drift::extract_dirspace_plans(&results_file)?;
    let with_changes: Vec<_> = dirspaces.into_iter().filter(|d| d.has_changes).collect();
    if with_changes.is_empty() {
        return done(state, true);
    }

    let output = drift::format_dirspaces(&with_changes);
    let report_id = format!("{:x}", md5::compute(output.as_bytes()));

    if let Some(existing) = find_matching_issue(&state, &report_id).await? {
        tracing::info!(
            "DRIFT_CREATE_ISSUE : ISSUE_EXISTS : {}",
            existing.get("id").and_then(|v| v.as_i64()).unwrap_or(0)
        );
        return done(state, true);
    }

    let issue_body = drift::format_issue_body(&output, &report_id);
    let created = create_issue(&state, &report_id, &issue_body).await?;
    done(state, created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_secrets_matches_github_convention() {
        let rt = GitlabCi::new();
        assert_eq!(rt.extract_secrets("::add-mask::tok\nplain"), vec!["tok"]);
    }

    #[test]
    fn update_workflow_steps_is_identity() {
        use crate::workflow::StepKind;
        let rt = GitlabCi::new();
        let steps =
            rt.update_workflow_steps(RunType::Apply, vec![Step::of_type(StepKind::Init)]);
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn detects_body_too_long_errors() {
        let body = serde_json::json!({
            "errors": [{"message": "body is too long (maximum is 1048576 characters)"}]
        });
        assert!(body_is_too_long(&body));
        assert!(!body_is_too_long(&serde_json::json!({"errors": []})));
        assert!(!body_is_too_long(&serde_json::json!({})));
    }
}
