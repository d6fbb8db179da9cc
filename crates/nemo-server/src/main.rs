#![doc = include_str!("../README.md")]

use anyhow::Context;
use clap::Parser;
use core::time::Duration;
use nemo_server::server::{
    config::{AskArgs, CliArgs, Command, Isolation, ServerConfig, Stage2WorkerArgs},
    generator::{ContentGenerator, GeminiGenerator},
    isolation::{ProcessSpawner, TaskSpawner, WorkerSpawner, run_worker},
    pipeline::Pipeline,
    service::router_with_body_limit,
    telemetry::{init_stderr_logging, init_telemetry},
    terminal,
};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let mut args = CliArgs::parse();

    match args.command.take() {
        Some(Command::Stage2Worker(worker)) => return run_stage2_worker(worker).await,
        Some(Command::Ask(ask)) => return run_ask(ServerConfig::try_from(args)?, ask).await,
        None => {}
    }

    let config = ServerConfig::try_from(args)?;
    let providers = init_telemetry()?;

    let result = serve(config).await;

    providers.shutdown();
    result
}

async fn run_stage2_worker(args: Stage2WorkerArgs) -> anyhow::Result<()> {
    init_stderr_logging()?;
    run_worker(
        args.processor_id,
        Duration::from_millis(args.transform_delay_ms),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;
    Ok(())
}

async fn run_ask(config: ServerConfig, args: AskArgs) -> anyhow::Result<()> {
    init_stderr_logging()?;
    let pipeline = start_pipeline(&config)?;

    let answered = terminal::ask(
        &pipeline,
        &args.prompts,
        args.image,
        Duration::from_millis(args.settle_ms),
    )
    .await;

    pipeline.shutdown().await;
    for view in answered? {
        println!("{}", terminal::render(&view));
    }
    Ok(())
}

fn start_pipeline(config: &ServerConfig) -> anyhow::Result<Pipeline> {
    let generator: Arc<dyn ContentGenerator> = Arc::new(GeminiGenerator::new(config.gemini.clone())?);
    let spawner: Arc<dyn WorkerSpawner> = match config.isolation {
        Isolation::Process => Arc::new(ProcessSpawner::current_exe(config.pipeline.transform_delay)?),
        Isolation::Task => Arc::new(TaskSpawner::new(config.pipeline.transform_delay)),
    };
    Ok(Pipeline::start(&config.pipeline, generator, spawner))
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;
    log_startup_info(&config);

    let pipeline = Arc::new(start_pipeline(&config)?);
    let app = router_with_body_limit(Arc::clone(&pipeline), config.max_body_bytes);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop the workers even if the server itself failed.
    pipeline.shutdown().await;
    served?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting nemo on {} with full config: {:#?}",
            config.server_addr,
            config.pipeline
        );
    } else {
        tracing::info!(
            "Starting nemo on {} with {} Stage-1 and {} Stage-2 workers",
            config.server_addr,
            config.pipeline.num_threads,
            config.pipeline.num_processes
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
