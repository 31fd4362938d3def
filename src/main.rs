use clap::Parser;
use config::Config;
use loopcast::ffmpeg::FfmpegSettings;
use loopcast::store::Store;
use loopcast::{create_app, transcoder};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Channel catalog file (overrides config)
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    catalog: Option<PathBuf>,
    #[serde(default)]
    ffmpeg: FfmpegSettings,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    /// External URL the concat playlists point back at. Defaults to the bind
    /// address; set it when running behind a proxy.
    #[serde(default)]
    base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            base_url: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!("configuration loaded from {}", args.config);

    if !transcoder::encoder_available(&settings.ffmpeg.path).await {
        warn!(
            "encoder executable not found at {} -- streams will fail until it exists",
            settings.ffmpeg.path
        );
    }

    let catalog_path = args.catalog.or(settings.catalog);
    let store = match &catalog_path {
        Some(path) => match Store::load_file(path).await {
            Ok(store) => {
                info!(
                    "catalog loaded from {}: {} channels",
                    path.display(),
                    store.channel_count().await
                );
                store
            }
            Err(e) => {
                error!("failed to load catalog {}: {}", path.display(), e);
                Store::empty()
            }
        },
        None => {
            warn!("no catalog configured; only /setup will stream");
            Store::empty()
        }
    };

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let base_url = settings
        .server
        .base_url
        .clone()
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", settings.server.port));

    let app = create_app(store, settings.ffmpeg, base_url);

    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
