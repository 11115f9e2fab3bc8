//! The `oidc` step: exchange the CI job's OIDC token for cloud credentials.
//!
//! `aws` assumes a role with the web identity token through the aws CLI;
//! `gcp` exchanges the token against STS and mints a service-account access
//! token through the IAM credentials API. All produced credentials are
//! registered as secrets before they reach the environment.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::api;
use crate::cmd::{self, CommandSpec};
use crate::error::Result;
use crate::retry;
use crate::run_state::RunState;
use crate::workflow::{env_keys, Outcome, Step};

const STEP_NAME: &str = "auth/oidc";

const TRIES: u32 = 3;
const INITIAL_SLEEP: Duration = Duration::from_secs(2);
const BACKOFF: f64 = 1.5;

const DEFAULT_AWS_AUDIENCE: &str = "sts.amazonaws.com";
const DEFAULT_DURATION: i64 = 3600;
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_SESSION_NAME: &str = "terrateam";

const REQUEST_URL_VAR: &str = "ACTIONS_ID_TOKEN_REQUEST_URL";
const REQUEST_TOKEN_VAR: &str = "ACTIONS_ID_TOKEN_REQUEST_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct OidcConfig {
    provider: Option<String>,
    // aws
    role_arn: Option<String>,
    session_name: Option<String>,
    duration: Option<Value>,
    audience: Option<String>,
    region: Option<String>,
    // gcp
    service_account: Option<String>,
    workload_identity_provider: Option<String>,
    access_token_lifetime: Option<Value>,
    access_token_subject: Option<String>,
    access_token_scopes: Option<Vec<String>>,
}

fn failed(state: RunState, text: impl Into<String>) -> Outcome {
    Outcome::new(
        state,
        STEP_NAME,
        serde_json::json!({ "text": text.into(), "visible_on": "error" }),
        false,
    )
}

fn subst(state: &RunState, s: &str) -> Result<String> {
    cmd::replace_vars(s, &state.env)
}

fn coerce_seconds(v: &Option<Value>, default: i64) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

/// Fetch the job's OIDC token from the CI token endpoint for an audience.
async fn web_identity_token(state: &RunState, audience: &str) -> Result<Option<String>> {
    let (Some(request_url), Some(request_token)) = (
        state.env.get(REQUEST_URL_VAR).cloned(),
        state.env.get(REQUEST_TOKEN_VAR).cloned(),
    ) else {
        return Ok(None);
    };

    let client = reqwest::Client::new();
    let auth = format!("bearer {request_token}");
    let res = api::send_with_retry(|| {
        client
            .get(&request_url)
            .header("authorization", &auth)
            .query(&[("audience", audience)])
    })
    .await?;

    if res.status() != reqwest::StatusCode::OK {
        return Ok(None);
    }

    let body: Value = res.json().await?;
    Ok(body
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string))
}

async fn run_aws(state: RunState, config: &OidcConfig) -> Result<Outcome> {
    let Some(role_arn) = &config.role_arn else {
        return Ok(failed(state, "oidc step requires role_arn"));
    };
    let role_arn = subst(&state, role_arn)?;
    let session_name = match &config.session_name {
        Some(s) => subst(&state, s)?,
        None => DEFAULT_SESSION_NAME.to_string(),
    };
    let duration = coerce_seconds(&config.duration, DEFAULT_DURATION);
    let audience = config
        .audience
        .clone()
        .unwrap_or_else(|| DEFAULT_AWS_AUDIENCE.to_string());
    let region = config
        .region
        .clone()
        .unwrap_or_else(|| DEFAULT_REGION.to_string());

    let Some(token) = web_identity_token(&state, &audience).await? else {
        return Ok(failed(
            state,
            "Could not retrieve web identity token from the runner",
        ));
    };
    let state = state.set_secret(&token);

    let argv = vec![
        "aws".to_string(),
        "sts".to_string(),
        "assume-role-with-web-identity".to_string(),
        "--role-arn".to_string(),
        role_arn,
        "--role-session-name".to_string(),
        session_name,
        "--web-identity-token".to_string(),
        token,
        "--duration-seconds".to_string(),
        duration.to_string(),
        "--output".to_string(),
        "json".to_string(),
    ];

    let spec = CommandSpec::new(argv).log_output(false);
    let out = retry::run(
        retry::Policy::new(TRIES, INITIAL_SLEEP, BACKOFF),
        || cmd::run_capture(&state, &spec),
        |res| match res {
            Ok(out) => out.success(),
            Err(_) => true,
        },
    )
    .await?;

    if !out.success() {
        tracing::info!("OIDC : aws : FAILED");
        return Ok(failed(state, out.merged()));
    }

    let creds: Value = match serde_json::from_str(&out.stdout) {
        Ok(v) => v,
        Err(e) => return Ok(failed(state, format!("Invalid STS response: {e}"))),
    };

    let access_key_id = creds
        .pointer("/Credentials/AccessKeyId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let secret_access_key = creds
        .pointer("/Credentials/SecretAccessKey")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let session_token = creds
        .pointer("/Credentials/SessionToken")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    tracing::info!("OIDC : aws : SUCCESS");

    let mut state = state
        .set_secret(&secret_access_key)
        .set_secret(&session_token);
    state.insert_env("AWS_ACCESS_KEY_ID", access_key_id);
    state.insert_env("AWS_SECRET_ACCESS_KEY", secret_access_key);
    state.insert_env("AWS_SESSION_TOKEN", session_token);
    state.insert_env("AWS_REGION", region.clone());
    state.insert_env("AWS_DEFAULT_REGION", region);

    Ok(Outcome::new(
        state,
        STEP_NAME,
        serde_json::json!({}),
        true,
    ))
}

/// Exchange the identity token for a federated access token.
async fn gcp_sts_token(provider_id: &str, web_identity_token: &str) -> Result<std::result::Result<String, String>> {
    let body = serde_json::json!({
        "audience": format!("//iam.googleapis.com/{provider_id}"),
        "grantType": "urn:ietf:params:oauth:grant-type:token-exchange",
        "requestedTokenType": "urn:ietf:params:oauth:token-type:access_token",
        "scope": "https://www.googleapis.com/auth/cloud-platform",
        "subjectTokenType": "urn:ietf:params:oauth:token-type:jwt",
        "subjectToken": web_identity_token,
    });

    let client = reqwest::Client::new();
    let res = api::send_with_retry(|| {
        client
            .post("https://sts.googleapis.com/v1/token")
            .header("Accept", "application/json")
            .json(&body)
    })
    .await?;

    if res.status() == reqwest::StatusCode::OK {
        let body: Value = res.json().await?;
        Ok(Ok(body
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()))
    } else {
        Ok(Err(res.text().await.unwrap_or_default()))
    }
}

/// Mint a service-account access token with the federated token.
async fn gcp_access_token(
    token: &str,
    service_account: &str,
    lifetime: i64,
    scopes: &[String],
) -> Result<std::result::Result<String, String>> {
    let url = format!(
        "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:generateAccessToken",
        urlencode(service_account)
    );
    let body = serde_json::json!({
        "lifetime": format!("{lifetime}s"),
        "delegates": [],
        "scope": scopes,
    });

    let client = reqwest::Client::new();
    let auth = format!("Bearer {token}");
    let res = api::send_with_retry(|| {
        client
            .post(&url)
            .header("Authorization", &auth)
            .header("Accept", "application/json")
            .json(&body)
    })
    .await?;

    if res.status() == reqwest::StatusCode::OK {
        let body: Value = res.json().await?;
        Ok(Ok(body
            .get("accessToken")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()))
    } else {
        Ok(Err(res.text().await.unwrap_or_default()))
    }
}

fn urlencode(s: &str) -> String {
    s.replace('@', "%40")
}

async fn run_gcp(state: RunState, config: &OidcConfig) -> Result<Outcome> {
    let Some(service_account) = &config.service_account else {
        return Ok(failed(state, "oidc step requires service_account"));
    };
    let Some(provider) = &config.workload_identity_provider else {
        return Ok(failed(state, "oidc step requires workload_identity_provider"));
    };

    if config.access_token_subject.is_some() {
        return Ok(failed(
            state,
            "access_token_subject (domain-wide delegation) is not supported",
        ));
    }

    let service_account = subst(&state, service_account)?;
    let provider = subst(&state, provider)?;
    let lifetime = coerce_seconds(&config.access_token_lifetime, DEFAULT_DURATION);
    let audience = match &config.audience {
        Some(a) => subst(&state, a)?,
        None => format!("https://iam.googleapis.com/{provider}"),
    };
    let scopes: Vec<String> = match &config.access_token_scopes {
        Some(scopes) => scopes
            .iter()
            .map(|s| subst(&state, s))
            .collect::<Result<_>>()?,
        None => vec!["https://www.googleapis.com/auth/cloud-platform".to_string()],
    };

    let Some(token) = web_identity_token(&state, &audience).await? else {
        return Ok(failed(
            state,
            "Could not retrieve web identity token from the runner",
        ));
    };

    tracing::info!("OIDC : gcp : SUCCESS");
    let state = state.set_secret(&token);

    let sts = match gcp_sts_token(&provider, &token).await? {
        Ok(sts) => sts,
        Err(text) => return Ok(failed(state, text)),
    };

    let access_token =
        match gcp_access_token(&sts, &service_account, lifetime, &scopes).await? {
            Ok(token) => token,
            Err(text) => return Ok(failed(state, text)),
        };

    let mut state = state.set_secret(&access_token);

    let token_file = match state.env.get(env_keys::TMPDIR) {
        Some(tmpdir) => std::path::Path::new(tmpdir).join("gcp_oidc_token_file"),
        None => return Ok(failed(state, "TERRATEAM_TMPDIR is not set")),
    };
    tokio::fs::write(&token_file, &access_token).await?;

    state.insert_env(
        "GOOGLE_OAUTH_ACCESS_TOKEN_FILE",
        token_file.display().to_string(),
    );
    state.insert_env("GOOGLE_OAUTH_ACCESS_TOKEN", access_token);

    Ok(Outcome::new(
        state,
        STEP_NAME,
        serde_json::json!({}),
        true,
    ))
}

pub async fn run(state: RunState, step: &Step) -> Result<Outcome> {
    let config: OidcConfig = step.parse_config()?;

    match config.provider.as_deref().unwrap_or("aws") {
        "aws" => run_aws(state, &config).await,
        "gcp" => run_gcp(state, &config).await,
        other => Ok(failed(
            state,
            format!("unknown oidc provider: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::fixtures;
    use crate::workflow::Step;

    #[test]
    fn coerces_durations() {
        assert_eq!(coerce_seconds(&None, 3600), 3600);
        assert_eq!(coerce_seconds(&Some(serde_json::json!(900)), 3600), 900);
        assert_eq!(coerce_seconds(&Some(serde_json::json!("1200")), 3600), 1200);
        assert_eq!(coerce_seconds(&Some(serde_json::json!("nope")), 3600), 3600);
    }

    #[tokio::test]
    async fn missing_role_arn_fails_the_step() {
        let state = fixtures::state();
        let step = Step::from_value(&serde_json::json!({"type": "oidc"})).unwrap();

        let outcome = run(state, &step).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.payload["text"]
            .as_str()
            .unwrap()
            .contains("role_arn"));
    }

    #[tokio::test]
    async fn missing_token_endpoint_fails_the_step() {
        let state = fixtures::state();
        let step = Step::from_value(&serde_json::json!({
            "type": "oidc",
            "role_arn": "arn:aws:iam::123456789012:role/terrateam",
        }))
        .unwrap();

        let outcome = run(state, &step).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.payload["text"]
            .as_str()
            .unwrap()
            .contains("web identity token"));
    }

    #[tokio::test]
    async fn domain_wide_delegation_is_rejected() {
        let state = fixtures::state();
        let step = Step::from_value(&serde_json::json!({
            "type": "oidc",
            "provider": "gcp",
            "service_account": "runner@example.iam.gserviceaccount.com",
            "workload_identity_provider": "projects/1/locations/global/workloadIdentityPools/p/providers/x",
            "access_token_subject": "user@example.com",
        }))
        .unwrap();

        let outcome = run(state, &step).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.payload["text"]
            .as_str()
            .unwrap()
            .contains("not supported"));
    }
}
