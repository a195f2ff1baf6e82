//! Worker process: runs the engine over stdin/stdout.

use anyhow::Context;

use sandproxy::scripted::ScriptedRunner;
use sandproxy::telemetry::init_tracing;
use sandproxy::worker::run_stdio_worker;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "sandproxy-worker starting"
    );

    let session = run_stdio_worker(ScriptedRunner::for_process())
        .await
        .context("worker channel failed")?;

    tracing::info!(
        session_id = ?session.id(),
        status = %session.status(),
        step_counter = session.step_counter(),
        "sandproxy-worker done"
    );
    Ok(())
}
