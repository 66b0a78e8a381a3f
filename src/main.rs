use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use codegrader::config::Settings;
use codegrader::core::{
    pipeline::{running::TestcaseRunner, submission::Pipeline},
    session::service::ProctoringService,
    traits::sandbox::Sandbox as _,
};
use codegrader::sandbox::{pool::WorkerPool, selector::SandboxSelector};
use codegrader::server::{self, handling::AppState};
use codegrader::store::memory::InMemoryStore;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CliArgs {
    /// TOML settings file. Built-in defaults are used when omitted.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Overrides `server.listen`.
    #[clap(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let args = CliArgs::parse();
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }

    let registry = Arc::new(settings.registry());
    tracing::info!("Languages: {}", registry.languages().join(", "));
    let backend = SandboxSelector::select(&settings.sandbox, registry)
        .await
        .context("No usable sandbox backend")?;
    let pool = WorkerPool::new(backend, settings.pool.max_concurrency);

    let store = Arc::new(InMemoryStore::with_questions(settings.questions.clone()));
    let runner = TestcaseRunner::new(Arc::new(pool.clone()), settings.sandbox.limits());
    let pipeline = Pipeline::new(runner, settings.scoring, store.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proctoring = ProctoringService::new(
        Arc::new(pipeline.clone()),
        store,
        settings.proctoring.duration_seconds,
        shutdown_rx.clone(),
    );

    let listener = TcpListener::bind(&settings.server.listen)
        .await
        .with_context(|| {
            format!(
                "Failed to listen on {} (field server.listen of the configuration)",
                settings.server.listen
            )
        })?;
    tracing::info!(
        "Listening on {} with {} sandbox slots ({})",
        settings.server.listen,
        pool.capacity(),
        pool.name()
    );
    let server = server::serve(listener, AppState::new(pipeline, proctoring), shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    // A closed receiver only means every consumer is already gone.
    let _ = shutdown_tx.send(true);
    pool.close();
    let grace = settings.server.shutdown_grace();
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined.context("Server task failed")?,
        Err(_) => tracing::warn!(
            "Requests still running after {}s, exiting anyway",
            grace.as_secs()
        ),
    }

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
