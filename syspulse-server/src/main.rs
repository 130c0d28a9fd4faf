use std::{net::IpAddr, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use confique::Config;
use tokio::{net::TcpListener, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    control::{CommandExecutor, ControlExecutor},
    delta::{CpuMode, DeltaEngine},
    sampler::{Sampled, Sampler},
    session::SessionManager,
    source::HostSource,
};

mod control;
mod delta;
mod format;
mod route;
mod sampler;
mod session;
mod source;

#[derive(Debug, Parser)]
#[command(name = "syspulse-server")]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Path to config file")]
    config_path: Option<String>,
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the server
    Serve,

    /// Print a single snapshot as JSON and exit
    Sample,
}

#[derive(Config, Debug)]
struct Conf {
    /// Port to listen on
    #[config(default = 3000, env = "SYSPULSE_PORT")]
    port: u16,

    /// Bind address
    #[config(default = "127.0.0.1", env = "SYSPULSE_ADDRESS")]
    address: IpAddr,

    /// Milliseconds between two pushes to the same observer
    #[config(default = 1000, env = "SYSPULSE_INTERVAL_MS")]
    interval_ms: u64,

    /// Disk usage is reported for the filesystem holding this path
    #[config(default = "/", env = "SYSPULSE_DISK_PATH")]
    disk_path: PathBuf,

    /// `delta` for utilization since the previous sample, `cumulative` for since boot
    #[config(default = "delta", env = "SYSPULSE_CPU_MODE")]
    cpu_mode: CpuMode,

    /// Command line run by `POST /system/restart`
    #[config(
        default = ["sudo", "reboot"],
        env = "SYSPULSE_RESTART_COMMAND",
        parse_env = confique::env::parse::list_by_space
    )]
    restart_command: Vec<String>,

    /// Command line run by `POST /system/shutdown`
    #[config(
        default = ["sudo", "shutdown", "now"],
        env = "SYSPULSE_SHUTDOWN_COMMAND",
        parse_env = confique::env::parse::list_by_space
    )]
    shutdown_command: Vec<String>,
}

fn config(path: &str) -> anyhow::Result<Conf> {
    let conf = Conf::builder().env().file(path).load()?;
    anyhow::ensure!(conf.interval_ms > 0, "interval_ms must be greater than zero");
    Ok(conf)
}

#[derive(Clone, Debug)]
pub(crate) struct AppState {
    pub sessions: Arc<SessionManager>,
    pub sampler: Arc<Sampler>,
    pub executor: Arc<dyn ControlExecutor>,
    pub ws_graceful_shutdown: WebsocketGraceful,
}

#[derive(Clone, Debug)]
pub(crate) struct WebsocketGraceful {
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

impl AppState {
    fn new(sampler: Sampler, executor: Arc<dyn ControlExecutor>, interval: Duration) -> Self {
        let sampler = Arc::new(sampler);
        let ws_graceful_shutdown = WebsocketGraceful {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        let sessions = Arc::new(SessionManager::new(
            sampler.clone(),
            interval,
            ws_graceful_shutdown.token.clone(),
            ws_graceful_shutdown.tracker.clone(),
        ));

        AppState {
            sessions,
            sampler,
            executor,
            ws_graceful_shutdown,
        }
    }
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(route::index))
        .route("/health", get(route::health))
        .route("/ws", get(route::push_ws))
        .nest(
            "/system",
            Router::new()
                .route("/restart", post(route::restart))
                .route("/shutdown", post(route::shutdown)),
        )
        .layer((
            TraceLayer::new_for_http(),
            // Prevent requests to hang forever
            TimeoutLayer::new(Duration::from_secs(60)),
        ))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    trace!("using command line arguments {:?}", cli);

    let config = config(&cli.config_path.unwrap_or("config.toml".to_owned()))?;
    trace!("using config {:?}", config);

    let interval = Duration::from_millis(config.interval_ms);
    let sampler = Sampler::new(
        HostSource::new(config.disk_path.clone()),
        DeltaEngine::new(config.cpu_mode),
    );

    match cli.commands {
        Commands::Serve => {
            let executor = Arc::new(CommandExecutor::new(
                config.restart_command,
                config.shutdown_command,
            ));
            let state = AppState::new(sampler, executor, interval);

            let addr = SocketAddr::from((config.address, config.port));
            info!("listening on {addr}");
            let listener = TcpListener::bind(addr).await?;

            axum::serve(listener, app(state.clone()))
                .with_graceful_shutdown(shutdown_signal(state.ws_graceful_shutdown.token.clone()))
                .await?;

            let ws_tracker = state.ws_graceful_shutdown.tracker.clone();
            ws_tracker.close();

            trace!("waiting {} websocket tasks to finish", ws_tracker.len());
            ws_tracker.wait().await;
        }
        Commands::Sample => {
            if config.cpu_mode == CpuMode::Delta {
                // seed the baseline so the printed figures cover one interval
                sampler.sample();
                tokio::time::sleep(interval).await;
            }
            let Sampled { snapshot, degraded } = sampler.sample();
            for e in degraded {
                tracing::warn!("{e}");
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                #[cfg(debug_assertions)]
                let default_log_level = format!(
                    "{}=debug,tower_http=debug,axum=trace",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                #[cfg(not(debug_assertions))]
                let default_log_level = format!(
                    "{}=info,tower_http=info,axum=info",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                default_log_level
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

async fn shutdown_signal(ws_token: CancellationToken) {
    let _ws_shutdown_guard = ws_token.drop_guard();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, closing observer sessions");
}
