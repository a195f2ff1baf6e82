//! Host-side CLI: run every step of a manifest through one worker.
//!
//! Responses are printed to stdout as JSON lines; diagnostics go to stderr.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{Context, bail};

use sandproxy::bridge::protocol::{Command, Manifest, Response};
use sandproxy::config::{ENV_COMMAND_TIMEOUT, ENV_LOG_DIR, ENV_WORKER, HostConfig};
use sandproxy::host::HostController;
use sandproxy::telemetry::init_tracing;

struct Args {
    manifest: PathBuf,
    worker: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    session_id: Option<String>,
    timeout: Option<Duration>,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: sandproxy-run <manifest.json> [options]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <manifest.json>      Manifest: {{\"steps\": [{{\"id\": ...}}], \"config\": {{}}}}");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --worker <path>      Worker program [default: $SANDPROXY_WORKER or sandproxy-worker]");
            eprintln!("  --log-dir <dir>      Log directory [default: $SANDPROXY_LOG_DIR or logs/<session-id>]");
            eprintln!("  --session-id <id>    Session id [default: random UUID]");
            eprintln!("  --timeout <secs>     Per-command timeout [default: $SANDPROXY_COMMAND_TIMEOUT_SECS or none]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut manifest: Option<PathBuf> = None;
    let mut parsed = Args {
        manifest: PathBuf::new(),
        worker: None,
        log_dir: None,
        session_id: None,
        timeout: None,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--worker" => {
                i += 1;
                parsed.worker = Some(PathBuf::from(
                    args.get(i).ok_or("--worker requires a value")?,
                ));
            }
            "--log-dir" => {
                i += 1;
                parsed.log_dir = Some(PathBuf::from(
                    args.get(i).ok_or("--log-dir requires a value")?,
                ));
            }
            "--session-id" => {
                i += 1;
                let id = args.get(i).ok_or("--session-id requires a value")?;
                if id.is_empty() {
                    return Err("--session-id must not be empty".to_string());
                }
                parsed.session_id = Some(id.clone());
            }
            "--timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout requires a value")?;
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout '{raw}'"))?;
                let timeout = Duration::try_from_secs_f64(secs)
                    .map_err(|_| format!("invalid --timeout '{raw}'"))?;
                parsed.timeout = Some(timeout);
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if manifest.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                manifest = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    parsed.manifest = manifest.ok_or("missing required argument: <manifest.json>")?;
    Ok(parsed)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let manifest = read_manifest(&args.manifest)?;
    manifest
        .validate()
        .with_context(|| format!("invalid manifest {}", args.manifest.display()))?;

    let session_id = args
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Flags win over the environment.
    let config = HostConfig::from_lookup(|key| match key {
        ENV_WORKER => args
            .worker
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| std::env::var(key).ok()),
        ENV_LOG_DIR => args
            .log_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| std::env::var(key).ok())
            .or_else(|| Some(format!("logs/{session_id}"))),
        ENV_COMMAND_TIMEOUT => args
            .timeout
            .map(|t| t.as_secs_f64().to_string())
            .or_else(|| std::env::var(key).ok()),
        _ => std::env::var(key).ok(),
    })
    .context("invalid configuration")?;

    tracing::info!(%session_id, steps = manifest.steps.len(), ?config, "Starting run");

    let mut host = HostController::start(config)
        .await
        .context("failed to start worker")?;
    let outcome = drive(&mut host, &session_id, manifest).await;
    let summary = host.stop().await.context("failed to stop worker")?;

    tracing::info!(
        %session_id,
        status = %summary.session_status,
        events = summary.logs.events,
        metrics = summary.logs.metrics,
        log_dir = %host.log_dir().display(),
        "Run finished"
    );
    outcome
}

fn read_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

async fn drive(host: &mut HostController, session_id: &str, manifest: Manifest) -> anyhow::Result<()> {
    let step_ids: Vec<String> = manifest.steps.iter().map(|s| s.id.clone()).collect();

    let ready = host
        .send(Command::Prepare {
            session_id: session_id.to_string(),
            manifest,
        })
        .await?;
    print_response(&ready)?;
    if ready.is_error() {
        bail!("worker rejected the manifest");
    }

    let mut failures = 0usize;
    for step_id in step_ids {
        let response = host
            .send_with_progress(
                Command::ExecStep {
                    session_id: session_id.to_string(),
                    step_id: step_id.clone(),
                    payload: serde_json::Value::Null,
                },
                |item| tracing::debug!(%step_id, name = item.name(), "Progress"),
            )
            .await
            .with_context(|| format!("step '{step_id}' did not complete"))?;
        print_response(&response)?;

        if response.is_fatal() {
            bail!("step '{step_id}' failed fatally");
        }
        if response.is_error() {
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} step(s) failed");
    }
    Ok(())
}

fn print_response(response: &Response) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(response)?);
    Ok(())
}
