//! Drift report formatting shared by the runtime adapters.
//!
//! A drift run's post hooks read the intermediate results file and turn the
//! plan outputs with changes into an issue body. The report id is a digest
//! of the rendered output so an unchanged drift does not open a duplicate
//! issue.

use serde_json::Value;

use crate::error::Result;

pub const TITLE: &str = "Terrateam: Drift Detected";

const ISSUE_HEADER: &str = r#"
## Terrateam Drift Detection Report
**Terrateam detected drift against live infrastructure.**

Create a new pull request to reconcile differences or enable automatic reconciliation using the Terrateam configuration file. See [Drift Detection](https://terrateam.io/docs/features/drift-detection) documentation for details.

## Terrateam Plan Output
"#;

#[derive(Debug, Clone)]
pub struct DirspacePlan {
    pub dir: String,
    pub workspace: String,
    pub plan: String,
    pub has_changes: bool,
    pub success: bool,
}

/// Pull the plan outputs with changes out of an intermediate results file.
pub fn extract_dirspace_plans(path: &str) -> Result<Vec<DirspacePlan>> {
    let content = std::fs::read_to_string(path)?;
    let data: Value = serde_json::from_str(&content)?;

    let mut ret = Vec::new();
    let steps = data
        .get("steps")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for step in steps {
        let is_plan = step.get("step").and_then(Value::as_str) == Some("tf/plan");
        let payload = step.get("payload").cloned().unwrap_or(Value::Null);
        let has_changes = payload
            .get("has_changes")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if is_plan && has_changes {
            let scope = step.get("scope").cloned().unwrap_or(Value::Null);
            ret.push(DirspacePlan {
                dir: scope
                    .get("dir")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                workspace: scope
                    .get("workspace")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                plan: payload
                    .get("plan")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                has_changes,
                success: step
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
    }

    Ok(ret)
}

fn format_dirspace_output(d: &DirspacePlan) -> String {
    if d.success {
        format!(
            "\n<details>\n<summary>Directory: {} | Workspace: {}</summary>\n\n```\n{}\n```\n\n</details>\n",
            d.dir, d.workspace, d.plan
        )
    } else {
        format!(
            "\n<details>\n<summary>Directory: {} | Workspace: {}</summary>\n\nRunning the plan failed, please see the action output for details\n\n</details>\n",
            d.dir, d.workspace
        )
    }
}

pub fn format_dirspaces(dirspaces: &[DirspacePlan]) -> String {
    dirspaces
        .iter()
        .map(format_dirspace_output)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_issue_body(output: &str, report_id: &str) -> String {
    format!("\n{ISSUE_HEADER}\n{output}\n---\nReport ID: {report_id}\n")
}

/// Drop the noisiest plan lines when an issue body exceeds the server's
/// size limit.
pub fn compact_issue_body(body: &str) -> String {
    body.lines()
        .filter(|line| {
            !line.contains(" Refreshing state...") && !line.contains("= (known after apply)")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results_file(content: &Value) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(content).unwrap()).unwrap();
        file
    }

    #[test]
    fn extracts_only_changed_plans() {
        let file = results_file(&serde_json::json!({
            "steps": [
                {
                    "step": "tf/plan",
                    "success": true,
                    "scope": {"type": "dirspace", "dir": "infra", "workspace": "default"},
                    "payload": {"has_changes": true, "plan": "+ aws_instance.web"}
                },
                {
                    "step": "tf/plan",
                    "success": true,
                    "scope": {"type": "dirspace", "dir": "quiet", "workspace": "default"},
                    "payload": {"has_changes": false, "plan": ""}
                },
                {
                    "step": "tf/init",
                    "success": true,
                    "scope": {"type": "dirspace", "dir": "infra", "workspace": "default"},
                    "payload": {}
                }
            ]
        }));

        let plans = extract_dirspace_plans(file.path().to_str().unwrap()).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].dir, "infra");
        assert_eq!(plans[0].plan, "+ aws_instance.web");
    }

    #[test]
    fn issue_body_carries_report_id() {
        let body = format_issue_body("some output", "abc123");
        assert!(body.contains("Report ID: abc123"));
        assert!(body.contains("Drift Detection Report"));
    }

    #[test]
    fn compaction_drops_refresh_noise() {
        let body = "keep me\naws_thing: Refreshing state... [id=1]\nx = (known after apply)\nalso keep";
        let compacted = compact_issue_body(body);
        assert_eq!(compacted, "keep me\nalso keep");
    }

    #[test]
    fn failed_plans_render_a_failure_note() {
        let d = DirspacePlan {
            dir: "infra".to_string(),
            workspace: "default".to_string(),
            plan: String::new(),
            has_changes: true,
            success: false,
        };
        let out = format_dirspaces(&[d]);
        assert!(out.contains("Running the plan failed"));
    }
}
