//! Dedicated per-archetype user process (component C2).
//!
//! One instance of this binary is spawned per [`UserArchetype`] by the
//! supervisor; it owns exactly one [`SessionManager`] and runs the
//! single-threaded tick loop the scheduler's concurrency model depends on
//! (see `netprobe_core::scheduler`).

mod sink;
mod ws;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Instant};

use axum::{routing::get, Router};
use axum_server::Handle;
use clap::Parser;
use config::{Config, File};
use netprobe_core::{
    archetype::UserArchetype,
    config::AppConfig,
    logging::LoggingSubscriberConfig,
    net::ServerBuilder,
    notify::ServiceNotifier,
    prng::PayloadPool,
    profiles::BulkProfileConfig,
    ratelimit::RateLimiter,
    scheduler::SessionManager,
    watchdog::{Watchdog, WatchdogConfig},
};
use tracing::info;
use tracing_subscriber::util::SubscriberInitExt;

/// State shared by every request handler in this process.
pub struct AppState {
    pub archetype: UserArchetype,
    pub manager: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub bulk_profile: BulkProfileConfig,
    pub fallback_download_mbps: f64,
    pub watchdog: Watchdog,
    pub started_at: Instant,
}

/// Start one archetype's dedicated traffic-generating user process.
#[derive(Parser, Debug)]
#[command(name = "netprobe-userproc")]
struct Cli {
    /// Archetype tag this process serves, e.g. "gamer" or "video_caller".
    #[arg(long)]
    archetype: String,
    /// Port to listen on.
    #[arg(long)]
    port: u16,
    /// Path to a YAML configuration file (tunables only; port/archetype
    /// always come from the CLI).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Path to a PEM certificate chain, overriding the config file.
    #[arg(long = "ssl-certfile")]
    ssl_certfile: Option<PathBuf>,
    /// Path to a PEM private key, overriding the config file.
    #[arg(long = "ssl-keyfile")]
    ssl_keyfile: Option<PathBuf>,
    /// Enable verbose development-friendly logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let Some(archetype) = UserArchetype::from_tag(&cli.archetype) else {
        eprintln!("unknown archetype tag: {}", cli.archetype);
        std::process::exit(2);
    };

    let mut config_builder = Config::builder();
    if let Some(path) = &cli.config {
        config_builder = config_builder.add_source(File::from(path.clone()));
    }
    let mut app_config: AppConfig = config_builder
        .build()
        .ok()
        .and_then(|raw| raw.try_deserialize::<AppConfig>().ok())
        .unwrap_or_default();
    app_config
        .with_app_name("netprobe-userproc")
        .with_app_version(env!("CARGO_PKG_VERSION"));
    if cli.debug && app_config.logging.subscribers.is_empty() {
        app_config.logging.subscribers.push(LoggingSubscriberConfig::default_for_dev());
    }
    if let Some(path) = &cli.ssl_certfile {
        app_config.tls.cert_file = Some(path.display().to_string());
    }
    if let Some(path) = &cli.ssl_keyfile {
        app_config.tls.key_file = Some(path.display().to_string());
    }

    let (registry, _log_guards) =
        app_config.logging.make_registry().expect("failed to build logging registry");
    registry.init();

    info!(archetype = archetype.tag(), port = cli.port, "starting virtual-household user process");

    let pool = Arc::new(PayloadPool::from_os_entropy());
    let manager = Arc::new(SessionManager::new(app_config.session.clone(), pool));
    let rate_limiter = Arc::new(RateLimiter::new(app_config.rate_limit.clone()));
    tokio::spawn(manager.clone().run());
    tokio::spawn(rate_limiter.clone().run_janitor());

    let mut watchdog: Watchdog = WatchdogConfig::default().into();
    watchdog.start();

    let notifier = ServiceNotifier::new();
    tokio::spawn(notifier.watchdog_task());

    let state = Arc::new(AppState {
        archetype,
        manager,
        rate_limiter,
        bulk_profile: app_config.bulk_profile,
        fallback_download_mbps: app_config.warmup.fallback_mbps,
        watchdog,
        started_at: Instant::now(),
    });

    let app = Router::new()
        .route("/health", get(ws::health_handler))
        .route("/stats", get(ws::stats_handler))
        .route("/ws/virtual-household/{archetype_tag}", get(ws::ws_upgrade_handler))
        .with_state(state);
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    let server_builder = ServerBuilder { listen: format!("0.0.0.0:{}", cli.port), ..Default::default() };
    let handle = Handle::new();
    server_builder
        .spawn_signal_handler(handle.clone(), app_config.supervisor.shutdown_grace)
        .expect("failed to install signal handler");

    notifier.on_ready();
    let result = if app_config.tls.is_enabled() {
        let server = server_builder
            .build_tls(
                app_config.tls.cert_file.clone().expect("checked by is_enabled"),
                app_config.tls.key_file.clone().expect("checked by is_enabled"),
            )
            .await
            .expect("failed to build TLS server");
        server.handle(handle).serve(service).await
    } else {
        let server = server_builder.build_plain().await.expect("failed to build server");
        server.handle(handle).serve(service).await
    };
    notifier.on_shutdown();
    result.expect("server error");
}
