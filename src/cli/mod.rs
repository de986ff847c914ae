//! Command-line interface.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 store/broker unreachable
//! at boot.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::broker;
use crate::config::Settings;
use crate::ocr::Dispatcher;
use crate::pipeline::PipelineDeps;
use crate::progress::ProgressReporter;
use crate::rate_limit::{RatePolicy, RateLimiters};
use crate::repository::Repositories;
use crate::server::{self, AppState};
use crate::storage;
use crate::worker::WorkerRuntime;

#[derive(Parser)]
#[command(name = "remocr", version, about = "Remote OCR job server")]
pub struct Cli {
    /// Path to a TOML config file (env vars override it).
    #[arg(long, global = true, env = "REMOCR_CONFIG")]
    pub config: Option<PathBuf>,

    /// More verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server, with an embedded worker unless --no-worker.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Serve the API only; jobs are executed by separate worker
        /// processes.
        #[arg(long)]
        no_worker: bool,
    },
    /// Run a worker process consuming the job queue.
    Worker,
    /// Show queue depth.
    Queue,
    /// Initialize the database schema and storage directories.
    Init,
}

/// Cheap pre-parse so logging can be configured before clap runs.
pub fn is_verbose() -> bool {
    std::env::args().any(|a| a == "-v" || a == "--verbose")
}

/// Everything a process needs after boot, fallible pieces first.
struct Runtime {
    settings: Arc<Settings>,
    repos: Repositories,
    store: Arc<dyn storage::ObjectStore>,
    broker: Arc<dyn broker::Broker>,
    deps: Arc<PipelineDeps>,
}

async fn boot(settings: Settings) -> Result<Runtime, ExitCode> {
    if let Err(e) = settings.ensure_directories() {
        eprintln!("error: failed to create data directories: {}", e);
        return Err(ExitCode::from(1));
    }
    let settings = Arc::new(settings);

    let repos = match Repositories::connect(&settings.database_url()).await {
        Ok(repos) => repos,
        Err(e) => {
            eprintln!("error: metadata store unavailable: {}", e);
            return Err(ExitCode::from(2));
        }
    };
    let store = match storage::from_settings(&settings) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("error: object store unavailable: {}", e);
            return Err(ExitCode::from(2));
        }
    };
    let broker = match broker::from_settings(&settings, repos.clone()).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("error: broker unavailable: {}", e);
            return Err(ExitCode::from(2));
        }
    };

    let limiters = Arc::new(RateLimiters::new(
        RatePolicy::unlimited(),
        settings.rate_limits.clone(),
        settings.max_global_ocr_requests,
    ));
    let dispatcher = Arc::new(Dispatcher::new(&settings, limiters));
    let reporter = Arc::new(ProgressReporter::new(
        repos.jobs.clone(),
        settings.debounce_interval,
    ));
    let deps = Arc::new(PipelineDeps {
        repos: repos.clone(),
        store: store.clone(),
        dispatcher,
        reporter,
        settings: settings.clone(),
    });

    Ok(Runtime {
        settings,
        repos,
        store,
        broker,
        deps,
    })
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Commands::Serve {
            host,
            port,
            no_worker,
        } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            let rt = match boot(settings).await {
                Ok(rt) => rt,
                Err(code) => return code,
            };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let ticker = rt.deps.reporter.clone().spawn_ticker(shutdown_rx.clone());

            let worker_task = if no_worker {
                None
            } else {
                let runtime = WorkerRuntime::new(rt.deps.clone(), rt.broker.clone());
                let rx = shutdown_rx.clone();
                Some(tokio::spawn(async move { runtime.run(rx).await }))
            };

            let state = AppState::new(
                rt.repos.clone(),
                rt.store.clone(),
                rt.broker.clone(),
                rt.settings.clone(),
            );
            let server_task = tokio::spawn(server::serve(state, shutdown_rx));

            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);

            if let Some(task) = worker_task {
                let _ = task.await;
            }
            let _ = ticker.await;
            match server_task.await {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    eprintln!("error: server failed: {}", e);
                    ExitCode::from(2)
                }
                Err(_) => ExitCode::from(2),
            }
        }
        Commands::Worker => {
            let rt = match boot(settings).await {
                Ok(rt) => rt,
                Err(code) => return code,
            };
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let ticker = rt.deps.reporter.clone().spawn_ticker(shutdown_rx.clone());

            let runtime = WorkerRuntime::new(rt.deps.clone(), rt.broker.clone());
            tracing::info!(worker = %runtime.identity(), "worker process ready");
            let worker_task = {
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { runtime.run(rx).await })
            };

            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
            let _ = worker_task.await;
            let _ = ticker.await;
            ExitCode::SUCCESS
        }
        Commands::Queue => {
            let rt = match boot(settings).await {
                Ok(rt) => rt,
                Err(code) => return code,
            };
            match rt.repos.jobs.queue_depth().await {
                Ok((queued, processing)) => {
                    println!(
                        "queued: {}\nprocessing: {}\nmax: {}",
                        queued, processing, rt.settings.max_queue_size
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::from(2)
                }
            }
        }
        Commands::Init => match boot(settings).await {
            Ok(rt) => {
                println!(
                    "initialized database at {} and storage at {}",
                    rt.settings.database_url(),
                    rt.settings.storage_url
                );
                ExitCode::SUCCESS
            }
            Err(code) => code,
        },
    }
}
