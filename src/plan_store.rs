//! Plan artifact persistence between the plan and apply runs.
//!
//! Three methods: `terrateam` ships the plan inline to the server as a
//! base64 envelope; `cmd` stores it with user-supplied store/fetch/delete
//! command templates and only the envelope (with the substituted fetch
//! command) goes to the server; `s3` is the `cmd` method with aws CLI
//! commands assembled from bucket/region/credentials config.
//!
//! The envelope is version 1. The fetch side also accepts a raw,
//! pre-envelope blob for plans stored by very old runners.

use std::collections::HashMap;

use base64::Engine as _;
use serde_json::Value;

use crate::cmd::{self, CommandSpec};
use crate::error::Result;
use crate::repo_config::PlanStorage;
use crate::run_state::RunState;

const METHOD_TERRATEAM: &str = "terrateam";
const METHOD_CMD: &str = "cmd";
const ENVELOPE_VERSION: u64 = 1;

const DEFAULT_S3_PATH: &str = "terrateam/plans/$dir/$workspace/$date-$time-$token";

struct CmdTemplates {
    store: Vec<String>,
    fetch: Vec<String>,
    delete: Vec<String>,
}

fn template_vars(
    state: &RunState,
    dir: &str,
    workspace: &str,
    plan_path: &str,
) -> HashMap<String, String> {
    let now = chrono::Local::now();
    HashMap::from([
        ("date".to_string(), now.format("%Y-%m-%d").to_string()),
        ("time".to_string(), now.format("%H%M%S").to_string()),
        ("dir".to_string(), dir.to_string()),
        ("workspace".to_string(), workspace.to_string()),
        ("token".to_string(), state.work_token.clone()),
        ("plan_path".to_string(), plan_path.to_string()),
    ])
}

async fn store_envelope(
    state: &RunState,
    envelope: &Value,
    dir: &str,
    workspace: &str,
    has_changes: bool,
) -> Result<(bool, String)> {
    state
        .api
        .store_plan(&state.work_token, dir, workspace, envelope, has_changes)
        .await
}

async fn store_terrateam(
    state: &RunState,
    dir: &str,
    workspace: &str,
    plan_path: &str,
    has_changes: bool,
) -> Result<(bool, String)> {
    let raw = match tokio::fs::read(plan_path).await {
        Ok(raw) => raw,
        Err(e) => return Ok((false, e.to_string())),
    };

    tracing::debug!(
        "PLAN : STORE_PLAN : dir={} : workspace={} : md5={:x}",
        dir,
        workspace,
        md5::compute(&raw)
    );

    let envelope = serde_json::json!({
        "data": base64::engine::general_purpose::STANDARD.encode(&raw),
        "method": METHOD_TERRATEAM,
        "version": ENVELOPE_VERSION,
    });

    store_envelope(state, &envelope, dir, workspace, has_changes).await
}

async fn store_cmd(
    state: &RunState,
    templates: &CmdTemplates,
    dir: &str,
    workspace: &str,
    plan_path: &str,
    has_changes: bool,
) -> Result<(bool, String)> {
    let vars = template_vars(state, dir, workspace, plan_path);

    let subst =
        |argv: &[String]| -> Vec<String> { argv.iter().map(|s| cmd::safe_substitute(s, &vars)).collect() };

    let envelope = serde_json::json!({
        "delete": subst(&templates.delete),
        "fetch": subst(&templates.fetch),
        "method": METHOD_CMD,
        "version": ENVELOPE_VERSION,
    });

    let store = subst(&templates.store);
    let out = cmd::run_capture(state, &CommandSpec::new(store)).await?;
    if out.success() {
        store_envelope(state, &envelope, dir, workspace, has_changes).await
    } else {
        Ok((false, out.merged()))
    }
}

fn s3_templates(
    bucket: &str,
    region: &str,
    path: Option<&str>,
    access_key_id: Option<&str>,
    secret_access_key: Option<&str>,
    store_extra_args: &[String],
    fetch_extra_args: &[String],
    delete_extra_args: &[String],
    delete_used_plans: bool,
) -> CmdTemplates {
    let url = format!("s3://{}/{}", bucket, path.unwrap_or(DEFAULT_S3_PATH));

    let mut prefix: Vec<String> = Vec::new();
    if access_key_id.is_some() || secret_access_key.is_some() {
        prefix.push("env".to_string());
        if let Some(key) = access_key_id {
            prefix.push(format!("AWS_ACCESS_KEY_ID={key}"));
        }
        if let Some(key) = secret_access_key {
            prefix.push(format!("AWS_SECRET_ACCESS_KEY={key}"));
        }
    }

    let mut store = prefix.clone();
    store.extend(["aws".to_string(), "s3".to_string(), "cp".to_string()]);
    store.extend(store_extra_args.iter().cloned());
    store.extend([
        "$plan_path".to_string(),
        url.clone(),
        "--region".to_string(),
        region.to_string(),
    ]);

    let mut fetch = prefix.clone();
    fetch.extend(["aws".to_string(), "s3".to_string(), "cp".to_string()]);
    fetch.extend(fetch_extra_args.iter().cloned());
    fetch.extend([
        url.clone(),
        "$plan_dst_path".to_string(),
        "--region".to_string(),
        region.to_string(),
    ]);

    let delete = if delete_used_plans {
        let mut delete = prefix;
        delete.extend(["aws".to_string(), "s3".to_string(), "rm".to_string()]);
        delete.extend(delete_extra_args.iter().cloned());
        delete.extend([url, "--region".to_string(), region.to_string()]);
        delete
    } else {
        Vec::new()
    };

    CmdTemplates {
        store,
        fetch,
        delete,
    }
}

/// Persist a plan artifact with the configured storage method. Returns
/// whether it stuck plus diagnostic output when it did not.
pub async fn store(
    state: &RunState,
    storage: &PlanStorage,
    dir: &str,
    workspace: &str,
    plan_path: &str,
    has_changes: bool,
) -> Result<(bool, String)> {
    match storage {
        PlanStorage::Terrateam => {
            store_terrateam(state, dir, workspace, plan_path, has_changes).await
        }
        PlanStorage::Cmd {
            store: store_tmpl,
            fetch,
            delete,
        } => {
            let templates = CmdTemplates {
                store: store_tmpl.clone(),
                fetch: fetch.clone(),
                delete: delete.clone().unwrap_or_default(),
            };
            store_cmd(state, &templates, dir, workspace, plan_path, has_changes).await
        }
        PlanStorage::S3 {
            bucket,
            region,
            path,
            access_key_id,
            secret_access_key,
            store_extra_args,
            fetch_extra_args,
            delete_extra_args,
            delete_used_plans,
        } => {
            let templates = s3_templates(
                bucket,
                region,
                path.as_deref(),
                access_key_id.as_deref(),
                secret_access_key.as_deref(),
                store_extra_args,
                fetch_extra_args,
                delete_extra_args,
                *delete_used_plans,
            );
            store_cmd(state, &templates, dir, workspace, plan_path, has_changes).await
        }
    }
}

async fn fetch_enveloped(
    state: &RunState,
    envelope: &Value,
    dir: &str,
    workspace: &str,
    plan_path: &str,
) -> Result<(bool, String)> {
    match envelope.get("method").and_then(Value::as_str) {
        Some(METHOD_TERRATEAM) => {
            let data = envelope.get("data").and_then(Value::as_str).unwrap_or("");
            let raw = match base64::engine::general_purpose::STANDARD.decode(data) {
                Ok(raw) => raw,
                Err(e) => return Ok((false, format!("Invalid plan data encoding: {e}"))),
            };

            tracing::debug!(
                "APPLY : LOAD_PLAN : dir={} : workspace={} : md5={:x}",
                dir,
                workspace,
                md5::compute(&raw)
            );

            tokio::fs::write(plan_path, raw).await?;
            Ok((true, String::new()))
        }
        Some(METHOD_CMD) => {
            let vars = HashMap::from([(
                "plan_dst_path".to_string(),
                plan_path.to_string(),
            )]);

            let fetch: Vec<String> = envelope
                .get("fetch")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(|s| cmd::safe_substitute(s, &vars))
                        .collect()
                })
                .unwrap_or_default();

            let code = cmd::run(state, &CommandSpec::new(fetch)).await?;
            if code != Some(0) {
                return Ok((
                    false,
                    "Failed to fetch plan, see action logs for more details".to_string(),
                ));
            }

            let delete: Vec<String> = envelope
                .get("delete")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
                .unwrap_or_default();
            if !delete.is_empty() {
                cmd::run(state, &CommandSpec::new(delete)).await?;
            }

            Ok((true, String::new()))
        }
        other => Ok((false, format!("Unknown plan storage method: {other:?}"))),
    }
}

/// Retrieve the stored plan for a dirspace into `plan_path`. Returns
/// whether it loaded plus an error message when it did not.
pub async fn fetch(
    state: &RunState,
    dir: &str,
    workspace: &str,
    plan_path: &str,
) -> Result<(bool, String)> {
    let Some(raw) = state
        .api
        .fetch_plan(&state.work_token, dir, workspace)
        .await?
    else {
        return Ok((false, "Could not load plan from backend".to_string()));
    };

    match serde_json::from_slice::<Value>(&raw) {
        Ok(envelope) if envelope.is_object() => {
            fetch_enveloped(state, &envelope, dir, workspace, plan_path).await
        }
        _ => {
            // Pre-envelope plans are the raw artifact bytes.
            tracing::debug!(
                "APPLY : LOAD_PLAN : dir={} : workspace={} : md5={:x}",
                dir,
                workspace,
                md5::compute(&raw)
            );
            tokio::fs::write(plan_path, raw).await?;
            Ok((true, String::new()))
        }
    }
}
