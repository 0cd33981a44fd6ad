use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use warp::Filter;

use voxauth::api::{auth, handle_rejection, health, webhook};
use voxauth::capture::{CaptureConfig, WsCapture};
use voxauth::config::{BaseConfig, Config};
use voxauth::embedding::{EmbeddingExtractor, DEFAULT_INFERENCE_DEADLINE};
use voxauth::fetch::HttpFetcher;
use voxauth::service::AuthService;
use voxauth::store::{establish_connection_pool, PgStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Optional JSON base configuration; the environment overrides it.
    conf: Option<PathBuf>,
}

fn setup_tracing(level: &str) {
    let filter = EnvFilter::try_new(level.to_ascii_lowercase())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let base = match args.conf {
        Some(path) => match BaseConfig::load(&path) {
            Ok(base) => base,
            Err(err) => {
                eprintln!("configuration error: {err}");
                process::exit(1);
            }
        },
        None => BaseConfig::default(),
    };
    let conf = match Config::resolve(base) {
        Ok(conf) => conf,
        Err(err) => {
            eprintln!("configuration error: {err}");
            process::exit(1);
        }
    };
    setup_tracing(&conf.log_level);
    tracing::info!("Starting voxauth on {}:{}", conf.host, conf.port);

    let host: IpAddr = match conf.host.parse() {
        Ok(host) => host,
        Err(_) => {
            eprintln!("configuration error: HOST is not a valid IP address");
            process::exit(1);
        }
    };

    // Database
    let pool = Arc::new(establish_connection_pool(&conf.db_url));
    let store = Arc::new(PgStore::new(pool));

    // Pipeline collaborators
    let fetcher = Arc::new(HttpFetcher::default());
    let extractor = Arc::new(EmbeddingExtractor::remote(
        &conf.model_url,
        DEFAULT_INFERENCE_DEADLINE,
    ));
    let capture_config = CaptureConfig {
        max_duration: conf.max_audio_duration(),
        session_timeout: conf.websocket_timeout(),
        ..CaptureConfig::default()
    };
    let service = Arc::new(AuthService::new(
        store,
        fetcher,
        Arc::new(WsCapture),
        extractor,
        capture_config,
        conf.voice_threshold,
    ));

    // Warm the encoder handle in the background so the first verification
    // does not pay the initialization cost.
    let warmup = service.clone();
    tokio::spawn(async move {
        if !warmup.model_ready().await {
            tracing::warn!("Speaker model not ready at startup");
        }
    });

    let log_requests = warp::log::custom(|info| {
        tracing::info!(
            "{} {} {} {}",
            info.remote_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "???".into()),
            info.method(),
            info.path(),
            info.status()
        );
    });

    let routes = auth::routes(service.clone())
        .or(webhook::routes(service.clone()))
        .or(health::routes(service))
        .recover(handle_rejection)
        .with(log_requests);

    warp::serve(routes).run((host, conf.port)).await;
}
