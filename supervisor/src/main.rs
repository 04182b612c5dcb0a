//! Supervisor process (component C1 + C6): spawns and health-checks one
//! child process per archetype, and directly serves the single-user HTTP
//! endpoints and the virtual-household aggregate/redirect surface.

mod children;
mod endpoints;

use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
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
    ratelimit::RateLimiter,
};
use tracing::info;
use tracing_subscriber::util::SubscriberInitExt;

use children::{ChildProcess, ChildSpawnOptions, HttpClient};

/// State shared by every request handler the supervisor serves directly.
pub struct AppState {
    pub pool: Arc<PayloadPool>,
    pub rate_limiter: Arc<RateLimiter>,
    pub children: Arc<Vec<Arc<ChildProcess>>>,
    pub http: HttpClient,
    pub tls_enabled: bool,
    pub base_port: u16,
}

/// Start the supervisor: one child process per archetype, plus the
/// single-user HTTP endpoints and the virtual-household aggregate API.
#[derive(Parser, Debug)]
#[command(name = "netprobe-supervisor")]
struct Cli {
    /// Host/address to bind the supervisor's own listener to.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on; defaults to the config's `ports.supervisor_port`.
    #[arg(long)]
    port: Option<u16>,
    /// Path to a YAML configuration file.
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
    /// Validate configuration and child binary discovery, then exit.
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

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
        .with_app_name("netprobe-supervisor")
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

    let userproc_exe = sibling_binary("netprobe-userproc");
    info!(path = %userproc_exe.display(), "resolved user process binary");

    if cli.test {
        info!("configuration validated, exiting (--test)");
        return;
    }

    let http = children::make_http_client();
    let opts_for = {
        let cli = &cli;
        let app_config = &app_config;
        move |_archetype: UserArchetype| ChildSpawnOptions {
            userproc_exe: userproc_exe.clone(),
            ssl_certfile: app_config.tls.cert_file.clone().map(PathBuf::from).or_else(|| cli.ssl_certfile.clone()),
            ssl_keyfile: app_config.tls.key_file.clone().map(PathBuf::from).or_else(|| cli.ssl_keyfile.clone()),
            debug: cli.debug,
        }
    };
    let children = Arc::new(
        children::start_all(
            &UserArchetype::ALL,
            app_config.ports.base_port,
            opts_for,
            &http,
        )
        .await,
    );
    tokio::spawn(children::run_health_loop(
        children.clone(),
        app_config.supervisor.clone(),
        http.clone(),
    ));

    let pool = Arc::new(PayloadPool::from_os_entropy());
    let rate_limiter = Arc::new(RateLimiter::new(app_config.rate_limit.clone()));
    tokio::spawn(rate_limiter.clone().run_janitor());

    let notifier = ServiceNotifier::new();
    tokio::spawn(notifier.watchdog_task());

    let tls_enabled = app_config.tls.is_enabled();
    let state = Arc::new(AppState {
        pool,
        rate_limiter,
        children,
        http,
        tls_enabled,
        base_port: app_config.ports.base_port,
    });

    let app = Router::new()
        .route("/download", get(endpoints::download_handler))
        .route("/warmup/bulk-download", get(endpoints::warmup_download_handler))
        .route("/upload", post(endpoints::upload_handler))
        .route("/ping", get(endpoints::ping_handler))
        .route("/ws/virtual-household/{archetype_tag}", get(endpoints::redirect_handler))
        .route("/virtual-household/health", get(endpoints::household_health_handler))
        .route("/virtual-household/stats", get(endpoints::household_stats_handler))
        .with_state(state);
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    let port = cli.port.unwrap_or(app_config.ports.supervisor_port);
    let server_builder = ServerBuilder { listen: format!("{}:{port}", cli.host), ..Default::default() };
    let handle = Handle::new();
    server_builder
        .spawn_signal_handler(handle.clone(), app_config.supervisor.shutdown_grace)
        .expect("failed to install signal handler");

    notifier.on_ready();
    info!(port, "supervisor listening");
    let result = if tls_enabled {
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

/// Locate a sibling binary in the same directory as the running supervisor
/// executable, falling back to a bare name lookup on `PATH`.
fn sibling_binary(name: &str) -> PathBuf {
    let exe_name = if cfg!(windows) { format!("{name}.exe") } else { name.to_string() };
    match env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join(&exe_name))) {
        Some(path) if path.is_file() => path,
        _ => PathBuf::from(exe_name),
    }
}
