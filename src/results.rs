//! Result aggregation: secret masking and result-format compatibility.
//!
//! Masking walks the whole results value. Secrets are applied
//! longest-first so a secret that is a substring of another cannot leave a
//! partially redacted remainder, and strings on the `unmasked` allowlist
//! (dirspace paths, workspace names, step names) are never altered even if
//! they collide with a secret value.
//!
//! The internal result shape is version 2 (a flat step list with scopes).
//! Servers that declared version 1 get the older per-dirspace/per-flow
//! shape via a pure structural transform.

use std::collections::HashSet;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::runtime::Runtime;

pub const RESULTS_VERSION: u32 = 2;

const REDACTION: &str = "***";

fn mask_string(secrets: &[String], unmasked: &HashSet<String>, s: &str) -> String {
    if unmasked.contains(s) {
        return s.to_string();
    }

    let mut out = s.to_string();
    for secret in secrets {
        if out.contains(secret.as_str()) {
            out = out.replace(secret.as_str(), REDACTION);
        }
    }
    out
}

/// Mask every occurrence of every secret in `value`, recursively.
/// `secrets` must already be sorted longest-first.
pub fn mask_value(secrets: &[String], unmasked: &HashSet<String>, value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(mask_string(secrets, unmasked, s)),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), mask_value(secrets, unmasked, v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| mask_value(secrets, unmasked, v))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Longest-first ordering for masking; ties broken lexically for
/// determinism.
pub fn sort_secrets(secrets: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut secrets: Vec<String> = secrets.into_iter().collect();
    secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    secrets
}

/// Collect masking directives emitted by subprocesses anywhere in the
/// results value.
pub fn extract_secrets(runtime: &dyn Runtime, value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => runtime.extract_secrets(s),
        Value::Object(map) => map
            .values()
            .flat_map(|v| extract_secrets(runtime, v))
            .collect(),
        Value::Array(items) => items
            .iter()
            .flat_map(|v| extract_secrets(runtime, v))
            .collect(),
        _ => Vec::new(),
    }
}

fn result_success(result: &Value) -> bool {
    result["success"].as_bool().unwrap_or(false)
        || result["ignore_errors"].as_bool().unwrap_or(false)
}

fn payload_text(result: &Value) -> Value {
    json!({ "text": result["payload"].get("text").cloned().unwrap_or(json!("")) })
}

fn output_plan_to_1(result: &Value) -> Value {
    json!({
        "has_changes": result["payload"].get("has_changes").cloned().unwrap_or(json!(true)),
        "plan_text": result["payload"].get("plan").cloned().unwrap_or(json!("")),
        "plan": result["payload"].get("text").cloned().unwrap_or(json!("")),
    })
}

fn output_cost_estimation_to_1(result: &Value) -> Value {
    let payload = &result["payload"];
    match payload.get("summary") {
        Some(summary) => {
            let dirspaces: Vec<Value> = payload["dirspaces"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|ds| ds["diff_monthly_cost"].as_f64().unwrap_or(0.0).abs() > f64::EPSILON)
                .map(|ds| {
                    json!({
                        "path": ds["dir"],
                        "workspace": ds["workspace"],
                        "diff_monthly_cost": ds["diff_monthly_cost"],
                        "prev_monthly_cost": ds["prev_monthly_cost"],
                        "total_monthly_cost": ds["total_monthly_cost"],
                    })
                })
                .collect();

            json!({
                "cost_estimation": {
                    "currency": payload["currency"],
                    "diff_monthly_cost": summary["diff_monthly_cost"],
                    "prev_monthly_cost": summary["prev_monthly_cost"],
                    "total_monthly_cost": summary["total_monthly_cost"],
                    "dirspaces": dirspaces,
                }
            })
        }
        None => payload_text(result),
    }
}

fn workflow_step_to_1(result: &Value) -> Result<Value> {
    let step = result["step"].as_str().unwrap_or("");
    let success = result_success(result);
    let payload = &result["payload"];

    let (workflow_step, outputs) = match step {
        "run" => (
            json!({
                "type": "run",
                "cmd": payload.get("cmd").cloned().unwrap_or(json!([])),
                "exit_code": payload.get("exit_code").cloned().unwrap_or(Value::Null),
            }),
            payload_text(result),
        ),
        "env" => (
            json!({
                "type": "env",
                "cmd": payload.get("cmd").cloned().unwrap_or(json!([])),
                "method": payload.get("method").cloned().unwrap_or(Value::Null),
                "name": payload.get("name").cloned().unwrap_or(Value::Null),
            }),
            payload_text(result),
        ),
        "checkout" => (json!({ "type": "checkout" }), payload_text(result)),
        "auth/oidc" => (json!({ "type": "oidc" }), payload_text(result)),
        "tf/apply" => (json!({ "type": "apply" }), payload_text(result)),
        "tf/plan" => (
            json!({ "type": "plan" }),
            if result["success"].as_bool().unwrap_or(false) {
                output_plan_to_1(result)
            } else {
                payload_text(result)
            },
        ),
        "tf/init" => (
            json!({
                "type": "run",
                "cmd": payload.get("cmd").cloned().unwrap_or(json!([])),
                "exit_code": payload.get("exit_code").cloned().unwrap_or(Value::Null),
            }),
            payload_text(result),
        ),
        "tf/cost-estimation" => (
            json!({ "type": "cost-estimation" }),
            if result["success"].as_bool().unwrap_or(false) {
                output_cost_estimation_to_1(result)
            } else {
                payload_text(result)
            },
        ),
        "tf/terrateam_ssh_key_setup" => (
            json!({ "type": "run", "cmd": ["terrateam_ssh_key_setup"] }),
            payload_text(result),
        ),
        "tf/tf_cloud_setup" => (
            json!({ "type": "run", "cmd": ["tf_cloud_setup"] }),
            payload_text(result),
        ),
        "tf/terraform" => (
            json!({
                "type": "run",
                "cmd": payload.get("cmd").cloned().unwrap_or(json!([])),
                "exit_code": payload.get("exit_code").cloned().unwrap_or(Value::Null),
            }),
            payload_text(result),
        ),
        "tf/drift-create-issue" => {
            return Ok(json!({
                "success": success,
                "workflow_step": { "type": "drift-create-issue" },
            }));
        }
        "auth/update-terrateam-github-token" => (
            json!({ "type": "run", "cmd": ["update-terrateam-github-token"] }),
            payload_text(result),
        ),
        other => {
            return Err(Error::Other(format!("Unknown output step: {other}")));
        }
    };

    Ok(json!({
        "success": success,
        "workflow_step": workflow_step,
        "outputs": outputs,
    }))
}

fn scope_key(scope: &Value) -> Result<String> {
    match scope["type"].as_str() {
        Some("run") => Ok(format!(
            "flow:{}/subflow:{}",
            scope["flow"].as_str().unwrap_or(""),
            scope["subflow"].as_str().unwrap_or("")
        )),
        Some("dirspace") => Ok(format!(
            "dir:{}/workspace:{}",
            scope["dir"].as_str().unwrap_or(""),
            scope["workspace"].as_str().unwrap_or("")
        )),
        other => Err(Error::Other(format!("Unknown scope type: {other:?}"))),
    }
}

fn hook_steps_to_1(steps: &[Value], subflow: &str) -> Result<Vec<Value>> {
    steps
        .iter()
        .filter(|s| {
            s["scope"]["type"] == json!("run")
                && s["scope"]["flow"] == json!("hooks")
                && s["scope"]["subflow"] == json!(subflow)
        })
        .map(workflow_step_to_1)
        .collect()
}

fn transform_to_1(results: &Value) -> Result<Value> {
    let steps = results["steps"].as_array().cloned().unwrap_or_default();

    // Group dirspace-scoped steps preserving first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut by_scope: std::collections::HashMap<String, (Value, Vec<Value>)> =
        std::collections::HashMap::new();

    for step in &steps {
        if step["scope"]["type"] == json!("dirspace") {
            let key = scope_key(&step["scope"])?;
            if !by_scope.contains_key(&key) {
                order.push(key.clone());
                by_scope.insert(key.clone(), (step["scope"].clone(), Vec::new()));
            }
            by_scope.get_mut(&key).unwrap().1.push(step.clone());
        }
    }

    let mut dirspaces = Vec::new();
    for key in order {
        let (scope, scope_steps) = &by_scope[&key];
        dirspaces.push(json!({
            "path": scope["dir"],
            "workspace": scope["workspace"],
            "success": scope_steps.iter().all(result_success),
            "outputs": scope_steps
                .iter()
                .map(workflow_step_to_1)
                .collect::<Result<Vec<_>>>()?,
        }));
    }

    Ok(json!({
        "overall": {
            "success": steps.iter().all(result_success),
            "outputs": {
                "pre": hook_steps_to_1(&steps, "pre")?,
                "post": hook_steps_to_1(&steps, "post")?,
            },
        },
        "dirspaces": dirspaces,
    }))
}

/// Convert the internal results shape into the version the server declared
/// support for.
pub fn transform(result_version: u32, results: &Value) -> Result<Value> {
    match result_version {
        v if v == RESULTS_VERSION => Ok(results.clone()),
        1 => transform_to_1(results),
        other => Err(Error::Other(format!(
            "Unknown results version {RESULTS_VERSION} -> {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::gitlab::GitlabCi;

    fn unmasked(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn masks_substrings_longest_first() {
        let secrets = sort_secrets(vec!["abc".to_string(), "abcdef".to_string()]);
        assert_eq!(secrets[0], "abcdef");

        let value = json!("abcdef123");
        let masked = mask_value(&secrets, &HashSet::new(), &value);
        assert_eq!(masked, json!("***123"));
    }

    #[test]
    fn masking_is_independent_of_registration_order() {
        let a = sort_secrets(vec!["abcdef".to_string(), "abc".to_string()]);
        let b = sort_secrets(vec!["abc".to_string(), "abcdef".to_string()]);
        let value = json!({"out": "abcdef123 and abc"});
        assert_eq!(
            mask_value(&a, &HashSet::new(), &value),
            mask_value(&b, &HashSet::new(), &value)
        );
        assert_eq!(
            mask_value(&a, &HashSet::new(), &value),
            json!({"out": "***123 and ***"})
        );
    }

    #[test]
    fn unmasked_allowlist_protects_exact_matches() {
        let secrets = sort_secrets(vec!["infra/prod".to_string()]);
        let allow = unmasked(&["infra/prod"]);

        // The exact string survives; occurrences inside other strings do not.
        assert_eq!(
            mask_value(&secrets, &allow, &json!("infra/prod")),
            json!("infra/prod")
        );
        assert_eq!(
            mask_value(&secrets, &allow, &json!("path is infra/prod here")),
            json!("path is *** here")
        );
    }

    #[test]
    fn masks_recursively_through_objects_and_arrays() {
        let secrets = sort_secrets(vec!["sekret".to_string()]);
        let value = json!({
            "a": ["sekret", {"b": "deep sekret value"}],
            "n": 42,
            "flag": true,
        });

        let masked = mask_value(&secrets, &HashSet::new(), &value);
        assert_eq!(masked["a"][0], json!("***"));
        assert_eq!(masked["a"][1]["b"], json!("deep *** value"));
        assert_eq!(masked["n"], json!(42));
    }

    #[test]
    fn extracts_secrets_from_nested_values() {
        let runtime = GitlabCi::new();
        let value = json!({
            "steps": [{"payload": {"text": "before\n::add-mask::tok123\nafter"}}]
        });

        assert_eq!(extract_secrets(&runtime, &value), vec!["tok123"]);
    }

    fn v2_results() -> Value {
        json!({
            "steps": [
                {
                    "ignore_errors": false,
                    "payload": {"text": "hook ok", "cmd": ["echo", "hi"], "exit_code": 0},
                    "scope": {"type": "run", "flow": "hooks", "subflow": "pre"},
                    "step": "run",
                    "success": true
                },
                {
                    "ignore_errors": false,
                    "payload": {"text": "init out"},
                    "scope": {"type": "dirspace", "dir": "infra", "workspace": "default"},
                    "step": "tf/init",
                    "success": true
                },
                {
                    "ignore_errors": false,
                    "payload": {"text": "raw plan", "plan": "+ resource", "has_changes": true},
                    "scope": {"type": "dirspace", "dir": "infra", "workspace": "default"},
                    "step": "tf/plan",
                    "success": true
                }
            ]
        })
    }

    #[test]
    fn version_2_passes_through() {
        let results = v2_results();
        assert_eq!(transform(2, &results).unwrap(), results);
    }

    #[test]
    fn transforms_to_version_1_shapes() {
        let v1 = transform(1, &v2_results()).unwrap();

        assert_eq!(v1["overall"]["success"], json!(true));
        assert_eq!(v1["overall"]["outputs"]["pre"].as_array().unwrap().len(), 1);
        assert!(v1["overall"]["outputs"]["post"].as_array().unwrap().is_empty());

        let dirspaces = v1["dirspaces"].as_array().unwrap();
        assert_eq!(dirspaces.len(), 1);
        assert_eq!(dirspaces[0]["path"], json!("infra"));
        assert_eq!(dirspaces[0]["workspace"], json!("default"));
        assert_eq!(dirspaces[0]["success"], json!(true));

        let outputs = dirspaces[0]["outputs"].as_array().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0]["workflow_step"]["type"], json!("run"));
        assert_eq!(outputs[1]["workflow_step"]["type"], json!("plan"));
        assert_eq!(outputs[1]["outputs"]["plan_text"], json!("+ resource"));
        assert_eq!(outputs[1]["outputs"]["has_changes"], json!(true));
    }

    #[test]
    fn ignored_failures_count_as_success_in_v1() {
        let results = json!({
            "steps": [{
                "ignore_errors": true,
                "payload": {"text": "failed but ignored"},
                "scope": {"type": "run", "flow": "hooks", "subflow": "pre"},
                "step": "run",
                "success": false
            }]
        });

        let v1 = transform(1, &results).unwrap();
        assert_eq!(v1["overall"]["success"], json!(true));
    }

    #[test]
    fn unknown_result_version_is_an_error() {
        assert!(transform(7, &v2_results()).is_err());
    }

    #[test]
    fn unknown_step_name_fails_the_transform() {
        let results = json!({
            "steps": [{
                "ignore_errors": false,
                "payload": {},
                "scope": {"type": "run", "flow": "hooks", "subflow": "pre"},
                "step": "mystery/step",
                "success": true
            }]
        });

        assert!(transform(1, &results).is_err());
    }
}
