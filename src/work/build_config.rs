//! The build-config manifest: run the repo's config-builder script and
//! send the produced configuration back to the server.

use std::os::unix::fs::PermissionsExt;

use serde_json::Value;

use crate::cmd::{self, CommandSpec};
use crate::error::{Error, Result};
use crate::run_state::RunState;

pub(crate) fn with_shebang(script: &str) -> String {
    if script.starts_with("#!") {
        script.to_string()
    } else {
        format!("#! /usr/bin/env bash\n\n{script}")
    }
}

pub(crate) async fn write_script(
    dir: &std::path::Path,
    name: &str,
    script: &str,
) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    tokio::fs::write(&path, with_shebang(script)).await?;

    let mut perms = tokio::fs::metadata(&path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(&path, perms).await?;

    Ok(path)
}

pub async fn run(state: &RunState) -> Result<()> {
    let builder = &state.repo_config.config_builder;
    if !builder.enabled {
        return Err(Error::Config("config builder is not enabled".to_string()));
    }
    let script = builder
        .script
        .clone()
        .ok_or_else(|| Error::Config("config builder has no script".to_string()))?;

    let tmp = tempfile::tempdir()?;
    let script_path = write_script(tmp.path(), "config-builder", &script).await?;

    let body = match run_builder(state, &script_path, tmp.path()).await {
        Ok(config) => serde_json::json!({ "config": config }),
        Err(e) => serde_json::json!({ "msg": e.to_string() }),
    };

    state
        .api
        .put_work_manifest(&state.work_token, &body)
        .await?;
    Ok(())
}

async fn run_builder(
    state: &RunState,
    script_path: &std::path::Path,
    cwd: &std::path::Path,
) -> Result<Value> {
    let spec = CommandSpec::new([script_path.display().to_string()])
        .cwd(cwd)
        .input(serde_json::to_string(&state.repo_config.raw)?);

    let out = cmd::run_capture(state, &spec).await?;
    if !out.success() {
        return Err(Error::Other(out.merged()));
    }

    Ok(serde_json::from_str(&out.stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_a_shebang_when_missing() {
        assert!(with_shebang("echo hi").starts_with("#! /usr/bin/env bash\n"));
        assert_eq!(with_shebang("#!/bin/sh\necho"), "#!/bin/sh\necho");
    }

    #[tokio::test]
    async fn written_scripts_are_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_script(tmp.path(), "builder", "echo '{}'").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
