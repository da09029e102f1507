use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::config_store::ConfigStore;
use common::CameraProfile;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use viewer::api::{self, AppState};
use viewer::board::FrameBoard;
use viewer::config::Config;
use viewer::metrics;
use viewer::ptz::OnvifPtzConnector;

#[derive(Parser)]
#[command(name = "camwall")]
#[command(about = "Live view, PTZ control and recording for RTSP/ONVIF cameras", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Camera configuration file
    #[arg(long, env = "CAMERA_CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured camera and serve the control API (default)
    Serve,

    /// Edit the stored camera list
    Cameras {
        #[command(subcommand)]
        action: CameraAction,
    },
}

#[derive(Subcommand)]
enum CameraAction {
    /// Print the stored cameras as JSON
    List,

    /// Add a camera
    Add {
        #[arg(long)]
        ip: String,

        #[arg(long, default_value_t = 554)]
        rtsp_port: u16,

        #[arg(long, default_value_t = 80)]
        onvif_port: u16,

        #[arg(long, default_value = "")]
        user: String,

        #[arg(long, default_value = "")]
        password: String,

        /// Full stream URL, replacing the one derived from the other fields
        #[arg(long)]
        rtsp_url: Option<String>,
    },

    /// Remove a camera by IP
    Remove { ip: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = telemetry::init_structured_logging(
        telemetry::LogConfig::new("camwall").with_version(env!("CARGO_PKG_VERSION")),
    )?;

    let mut config = Config::from_env()?;
    if let Some(path) = cli.config {
        config.camera_config_path = path;
    }
    let store = ConfigStore::new(&config.camera_config_path);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, store).await,
        Commands::Cameras { action } => edit_cameras(&store, action).await,
    }
}

async fn serve(config: Config, store: ConfigStore) -> Result<()> {
    metrics::init();

    let profiles = store.load_or_env().await.context("failed to load camera configuration")?;
    if profiles.is_empty() {
        warn!(path = %store.path().display(), "no cameras configured");
    }

    let board = Arc::new(FrameBoard::new());
    let registry = viewer::build_registry(
        &config,
        Arc::new(config.frame_source()),
        Arc::new(OnvifPtzConnector::new(Duration::from_secs(10))?),
        Arc::new(config.sink_factory()),
        board.clone(),
    );

    let report = registry.attach(profiles).await;
    for rejected in &report.rejected {
        warn!(camera = %rejected.camera, reason = %rejected.reason, "camera not started");
    }

    let app = api::router(AppState {
        registry: registry.clone(),
        board,
        store,
    });

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, cameras = report.started.len(), "camwall started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stopped = registry.detach_all().await;
    info!(stopped, "camwall stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn edit_cameras(store: &ConfigStore, action: CameraAction) -> Result<()> {
    let mut profiles = store.load().await?;

    match action {
        CameraAction::List => {
            let entries: Vec<_> = profiles.iter().map(CameraProfile::to_mapping).collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }
        CameraAction::Add {
            ip,
            rtsp_port,
            onvif_port,
            user,
            password,
            rtsp_url,
        } => {
            let mut profile = CameraProfile::new(ip)
                .with_ports(rtsp_port, onvif_port)
                .with_credentials(user, password);
            if let Some(url) = rtsp_url {
                profile = profile.with_rtsp_url(url);
            }
            info!(camera = %profile.ip, "adding camera");
            profiles.push(profile);
        }
        CameraAction::Remove { ip } => {
            let before = profiles.len();
            profiles.retain(|p| p.identity() != ip);
            if profiles.len() == before {
                anyhow::bail!("no camera with ip {ip}");
            }
            info!(camera = %ip, "removing camera");
        }
    }

    store.save(&profiles).await?;
    info!(path = %store.path().display(), cameras = profiles.len(), "camera configuration saved");
    Ok(())
}
