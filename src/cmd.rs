//! External process execution.
//!
//! Commands are argv lists whose elements (and per-call environment values)
//! may reference environment variables as `${NAME}` or `$NAME`. References
//! are substituted from the merged environment until a fixed point is
//! reached; a reference to a variable that does not exist is a
//! [`Error::MissingEnvVar`] which step handlers turn into a failed step
//! result rather than letting it escape.
//!
//! Captured output is read from stdout and stderr concurrently, line by
//! line. Every line has ANSI color sequences stripped. Lines the runtime
//! recognizes as CI control commands (e.g. a masking directive) are routed
//! to the process's real stdout so the CI executor sees them; everything
//! else goes to the log, tagged with the working directory.
//!
//! A non-zero exit code is not an error at this layer. Engines interpret
//! exit codes themselves (terraform's plan uses 2 for "changes present").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};
use crate::run_state::RunState;
use crate::runtime::Runtime;

static ANSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());
static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))").unwrap());

// Substitution passes are capped so that a self-referential environment
// cannot loop forever; a string that stops changing is done earlier.
const MAX_SUBSTITUTION_PASSES: usize = 16;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub cmd: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub input: Option<String>,
    pub log_output: bool,
    pub replace_vars: bool,
}

impl CommandSpec {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            cwd: None,
            input: None,
            log_output: true,
            replace_vars: true,
        }
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn log_output(mut self, log_output: bool) -> Self {
        self.log_output = log_output;
        self
    }

    pub fn replace_vars(mut self, replace_vars: bool) -> Self {
        self.replace_vars = replace_vars;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr then stdout, the order the tools' own error text reads best.
    pub fn merged(&self) -> String {
        format!("{}\n{}", self.stderr, self.stdout)
    }
}

pub fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

fn substitute_once(s: &str, env: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;

    for caps in VAR_RE.captures_iter(s) {
        let m = caps.get(0).unwrap();
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|g| g.as_str())
            .unwrap();

        match env.get(name) {
            Some(v) => {
                out.push_str(&s[last..m.start()]);
                out.push_str(v);
                last = m.end();
            }
            None => return Err(Error::MissingEnvVar(name.to_string())),
        }
    }

    out.push_str(&s[last..]);
    Ok(out)
}

/// Substitute `${NAME}`/`$NAME` references from `env` until the string stops
/// changing. Fails closed: any reference to an unset variable is an error.
pub fn replace_vars(s: &str, env: &HashMap<String, String>) -> Result<String> {
    let mut cur = s.to_string();

    for _ in 0..MAX_SUBSTITUTION_PASSES {
        let next = substitute_once(&cur, env)?;
        if next == cur {
            return Ok(cur);
        }
        cur = next;
    }

    Ok(cur)
}

/// Single-pass substitution that leaves unknown references untouched. Used
/// for stored command templates whose variables are filled in later, on a
/// different machine.
pub fn safe_substitute(s: &str, vars: &HashMap<String, String>) -> String {
    VAR_RE
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|g| g.as_str())
                .unwrap();
            match vars.get(name) {
                Some(v) => v.clone(),
                None => caps.get(0).unwrap().as_str().to_string(),
            }
        })
        .into_owned()
}

/// Merge per-call environment overrides into the parent environment.
/// Override values are substituted against the parent environment only.
pub fn create_env(
    env: &HashMap<String, String>,
    additional: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut merged = env.clone();
    for (k, v) in additional {
        merged.insert(k.clone(), replace_vars(v, env)?);
    }
    Ok(merged)
}

fn resolve(state: &RunState, spec: &CommandSpec) -> Result<(Vec<String>, HashMap<String, String>, PathBuf)> {
    if spec.cmd.is_empty() {
        return Err(Error::Config("command must not be empty".to_string()));
    }

    let env = create_env(&state.env, &spec.env)?;
    let cmd = if spec.replace_vars {
        spec.cmd
            .iter()
            .map(|s| replace_vars(s, &env))
            .collect::<Result<Vec<_>>>()?
    } else {
        spec.cmd.clone()
    };

    let cwd = spec
        .cwd
        .clone()
        .unwrap_or_else(|| state.working_dir.clone());

    Ok((cmd, env, cwd))
}

/// Run a command without capturing output, for side-effecting commands whose
/// output is only interesting on the console.
pub async fn run(state: &RunState, spec: &CommandSpec) -> Result<Option<i32>> {
    let (cmd, env, cwd) = resolve(state, spec)?;

    tracing::debug!("CMD : cmd={:?} : cwd={}", cmd, cwd.display());

    let mut command = tokio::process::Command::new(&cmd[0]);
    command
        .args(&cmd[1..])
        .env_clear()
        .envs(&env)
        .current_dir(&cwd);

    if !spec.log_output {
        command.stdout(Stdio::null());
    }

    let status = command.status().await?;
    Ok(status.code())
}

async fn consume_lines<R>(
    reader: R,
    stream: &str,
    cwd: &Path,
    log_output: bool,
    runtime: &dyn Runtime,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut out = String::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = strip_ansi(&line);

        if log_output {
            if runtime.is_command(&line) {
                // CI control commands must reach the executor's stdout.
                println!("{line}");
            } else {
                tracing::info!("cwd={} : {} : {}", cwd.display(), stream, line);
            }
        }

        out.push_str(&line);
        out.push('\n');
    }

    out
}

/// Run a command capturing stdout and stderr. The two streams are consumed
/// concurrently so neither pipe can fill and stall the child.
pub async fn run_capture(state: &RunState, spec: &CommandSpec) -> Result<CapturedOutput> {
    let (cmd, env, cwd) = resolve(state, spec)?;

    tracing::debug!("CMD : cmd={:?} : cwd={}", cmd, cwd.display());

    let mut command = tokio::process::Command::new(&cmd[0]);
    command
        .args(&cmd[1..])
        .env_clear()
        .envs(&env)
        .current_dir(&cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    let mut stdin = child.stdin.take();
    if let Some(input) = &spec.input {
        if let Some(stdin) = stdin.as_mut() {
            stdin.write_all(input.as_bytes()).await?;
        }
    }
    drop(stdin);

    let child_stdout = child.stdout.take().expect("stdout is piped");
    let child_stderr = child.stderr.take().expect("stderr is piped");

    let (stdout, stderr) = tokio::join!(
        consume_lines(
            child_stdout,
            "stdout",
            &cwd,
            spec.log_output,
            state.runtime.as_ref()
        ),
        consume_lines(
            child_stderr,
            "stderr",
            &cwd,
            spec.log_output,
            state.runtime.as_ref()
        ),
    );

    let status = child.wait().await?;

    Ok(CapturedOutput {
        exit_code: status.code(),
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::fixtures;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn strips_ansi_color_sequences() {
        assert_eq!(strip_ansi("\x1b[31mERROR\x1b[0m"), "ERROR");
        assert_eq!(strip_ansi("plain"), "plain");
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[m"), "ok");
    }

    #[test]
    fn replace_vars_resolves_recursively() {
        let env = env(&[("A", "${B}"), ("B", "x")]);
        assert_eq!(replace_vars("${A}-${B}", &env).unwrap(), "x-x");
    }

    #[test]
    fn replace_vars_supports_bare_references() {
        let env = env(&[("DIR", "infra")]);
        assert_eq!(replace_vars("$DIR/main.tf", &env).unwrap(), "infra/main.tf");
    }

    #[test]
    fn replace_vars_fails_closed_on_missing() {
        let err = replace_vars("${MISSING}", &HashMap::new()).unwrap_err();
        match err {
            Error::MissingEnvVar(name) => assert_eq!(name, "MISSING"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn replace_vars_terminates_on_self_reference() {
        let env = env(&[("A", "${A}")]);
        assert_eq!(replace_vars("${A}", &env).unwrap(), "${A}");
    }

    #[test]
    fn safe_substitute_leaves_unknowns() {
        let vars = env(&[("dir", "prod")]);
        assert_eq!(
            safe_substitute("s3/plans/$dir/$workspace", &vars),
            "s3/plans/prod/$workspace"
        );
    }

    #[test]
    fn create_env_substitutes_against_parent_only() {
        let parent = env(&[("HOME", "/root"), ("NAME", "tf")]);
        let additional = env(&[("PLAN", "${HOME}/${NAME}.plan")]);
        let merged = create_env(&parent, &additional).unwrap();
        assert_eq!(merged["PLAN"], "/root/tf.plan");
        assert_eq!(merged["HOME"], "/root");
    }

    #[tokio::test]
    async fn run_capture_collects_both_streams() {
        let state = fixtures::state();
        let spec = CommandSpec::new(["sh", "-c", "echo out; echo err >&2"]).log_output(false);

        let out = run_capture(&state, &spec).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn run_capture_substitutes_command_elements() {
        let mut state = fixtures::state();
        state.env.insert("GREETING".to_string(), "hello".to_string());
        let spec = CommandSpec::new(["echo", "${GREETING}"]).log_output(false);

        let out = run_capture(&state, &spec).await.unwrap();
        assert_eq!(out.stdout, "hello\n");
    }

    #[tokio::test]
    async fn run_capture_missing_var_is_an_error() {
        let state = fixtures::state();
        let spec = CommandSpec::new(["echo", "${NOT_SET_ANYWHERE}"]);

        match run_capture(&state, &spec).await {
            Err(Error::MissingEnvVar(name)) => assert_eq!(name, "NOT_SET_ANYWHERE"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_capture_strips_ansi_from_output() {
        let state = fixtures::state();
        let spec =
            CommandSpec::new(["sh", "-c", "printf '\\033[31mred\\033[0m\\n'"]).log_output(false);

        let out = run_capture(&state, &spec).await.unwrap();
        assert_eq!(out.stdout, "red\n");
    }

    #[tokio::test]
    async fn run_capture_feeds_stdin() {
        let state = fixtures::state();
        let spec = CommandSpec::new(["cat"]).input("fed via stdin").log_output(false);

        let out = run_capture(&state, &spec).await.unwrap();
        assert_eq!(out.stdout, "fed via stdin\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let state = fixtures::state();
        let spec = CommandSpec::new(["sh", "-c", "exit 3"]).log_output(false);

        let out = run_capture(&state, &spec).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }
}
