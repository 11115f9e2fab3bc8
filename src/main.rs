use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::debug;

use terrat_runner::api;
use terrat_runner::error::Error;
use terrat_runner::repo_config::RepoConfig;
use terrat_runner::run_state::RunState;
use terrat_runner::runtime;
use terrat_runner::work;
use terrat_runner::work_exec;
use terrat_runner::work_manifest::ManifestKind;
use terrat_runner::workflow::env_keys;

const DEFAULT_API_BASE_URL: &str = "https://app.terrateam.io";

const REPO_CONFIG_PATHS: [&str; 2] = [".terrateam/config.yml", ".terrateam/config.yaml"];

// Bounds the manifest poll loop against servers that never answer `done`.
const MAX_WORK_MANIFESTS: u32 = 32;

const BANNER: &str = r"
 ____  _____    _    ____
|  _ \| ____|  / \  |  _ \
| |_) |  _|   / _ \ | | | |
|  _ <| |___ / ___ \| |_| |
|_| \_\_____/_/   \_\____/

 __  __ _____
|  \/  | ____|
| |\/| |  _|
| |  | | |___
|_|  |_|_____|
";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RuntimeKind {
    Github,
    Gitlab,
}

impl RuntimeKind {
    fn name(&self) -> &'static str {
        match self {
            RuntimeKind::Github => "github",
            RuntimeKind::Gitlab => "gitlab",
        }
    }
}

/// Terrateam Runner
#[derive(Parser)]
#[command(name = "terrat-runner")]
#[command(about = "Execute Terrateam work manifests", long_about = None)]
struct Cli {
    /// Work token
    #[arg(long)]
    work_token: String,

    /// Path to the checked-out workspace
    #[arg(long)]
    workspace: PathBuf,

    /// Base URL for the API
    #[arg(long, default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    /// CI run id
    #[arg(long)]
    run_id: String,

    /// SHA of the checkout being run on
    #[arg(long)]
    sha: String,

    /// CI runtime hosting this run
    #[arg(long, value_enum, default_value = "github")]
    runtime: RuntimeKind,

    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// `SECRETS_CONTEXT` is a JSON object of secret key/value pairs; expand it
/// into the environment. A value that does not decode is ignored.
fn set_secrets_context(state: &mut RunState) {
    let Some(secrets_context) = state.env.get("SECRETS_CONTEXT").cloned() else {
        return;
    };

    match serde_json::from_str::<serde_json::Value>(&secrets_context) {
        Ok(serde_json::Value::Object(secrets)) => {
            for (k, v) in secrets {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                state.insert_env(k, value);
            }
        }
        Ok(_) | Err(_) => {
            tracing::error!("Failed to decode SECRETS_CONTEXT");
        }
    }
}

async fn run_one_manifest(cli: &Cli, client: &Arc<api::Client>) -> anyhow::Result<ManifestKind> {
    debug!("LOADING : WORK_MANIFEST");
    let manifest = client
        .initiate_work_manifest(&cli.work_token, &cli.run_id, &cli.sha)
        .await?;

    if manifest.kind == ManifestKind::Done {
        return Ok(ManifestKind::Done);
    }

    debug!("LOADING : REPO_CONFIG");
    let config_paths: Vec<PathBuf> = REPO_CONFIG_PATHS
        .iter()
        .map(|p| cli.workspace.join(p))
        .collect();
    let repo_config = RepoConfig::load(&config_paths)?;

    let runtime = runtime::select(cli.runtime.name())?;

    let env: HashMap<String, String> = std::env::vars().collect();
    let kind = manifest.kind;
    let run_kind = manifest.run_kind.clone();

    let mut state = RunState::new(
        client.clone(),
        env,
        Arc::new(repo_config),
        runtime.clone(),
        cli.sha.clone(),
        Arc::new(manifest),
        cli.work_token.clone(),
        cli.workspace.clone(),
    );

    state.insert_env(env_keys::ROOT, cli.workspace.display().to_string());
    state.insert_env("INFRACOST_PARALLELISM", "1");
    if let Some(run_kind) = run_kind {
        state.insert_env(env_keys::RUN_KIND, run_kind);
    }
    set_secrets_context(&mut state);

    let state = runtime.initialize(state).await?;

    debug!("EXEC : {}", kind.as_str());
    match kind {
        ManifestKind::Plan => {
            work_exec::run(state, Arc::new(work::plan::Exec)).await?;
        }
        ManifestKind::Apply => {
            work_exec::run(state, Arc::new(work::apply::Exec)).await?;
        }
        ManifestKind::UnsafeApply => {
            work_exec::run(state, Arc::new(work::unsafe_apply::Exec)).await?;
        }
        ManifestKind::Index => work::index::run(&state).await?,
        ManifestKind::BuildConfig => work::build_config::run(&state).await?,
        ManifestKind::BuildTree => work::build_tree::run(&state).await?,
        ManifestKind::Done => unreachable!("handled above"),
    }

    Ok(kind)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .with_writer(std::io::stderr)
        .init();

    println!("{BANNER}");
    println!("*** These are not the logs you are looking for ***");
    println!("***");
    println!("*** The output of the runner is not meant for debugging purposes ***");
    println!("***");

    if let Err(e) = run(cli).await {
        tracing::error!("Fatal error: {e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Arc::new(api::Client::new(&cli.api_base_url)?);

    for _ in 0..MAX_WORK_MANIFESTS {
        match run_one_manifest(&cli, &client).await {
            Ok(ManifestKind::Done) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                if let Some(Error::NoWorkManifest) = e.downcast_ref::<Error>() {
                    eprintln!(
                        "No work manifest found for this run. This usually means the \
                         workflow was triggered manually rather than by Terrateam."
                    );
                }
                return Err(e);
            }
        }
    }

    Err(anyhow::anyhow!(
        "server never reported done after {MAX_WORK_MANIFESTS} work manifests"
    ))
}
