//! Child-process lifecycle management (component C1): spawn one user
//! process per archetype, poll its health, restart it with backoff on
//! sustained failure, and report aggregate status.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use netprobe_core::{archetype::UserArchetype, config::SupervisorConfig};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

/// HTTP client used to poll every child's `/health` and `/stats` endpoints.
pub type HttpClient = Client<HttpConnector, Empty<Bytes>>;

#[must_use]
pub fn make_http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Launch options common to every child process, supplied once at
/// supervisor startup.
pub struct ChildSpawnOptions {
    pub userproc_exe: PathBuf,
    pub ssl_certfile: Option<PathBuf>,
    pub ssl_keyfile: Option<PathBuf>,
    pub debug: bool,
}

/// One archetype's dedicated child process and its health bookkeeping.
pub struct ChildProcess {
    pub archetype: UserArchetype,
    pub port: u16,
    opts: ChildSpawnOptions,
    child: Mutex<Option<Child>>,
    consecutive_failures: AtomicU32,
    restart_attempts: AtomicU32,
    unreachable: AtomicBool,
    last_health: Mutex<Option<Value>>,
}

impl ChildProcess {
    fn new(archetype: UserArchetype, port: u16, opts: ChildSpawnOptions) -> Arc<Self> {
        Arc::new(Self {
            archetype,
            port,
            opts,
            child: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            restart_attempts: AtomicU32::new(0),
            unreachable: AtomicBool::new(false),
            last_health: Mutex::new(None),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.opts.userproc_exe);
        cmd.arg("--archetype")
            .arg(self.archetype.tag())
            .arg("--port")
            .arg(self.port.to_string());
        if let Some(cert) = &self.opts.ssl_certfile {
            cmd.arg("--ssl-certfile").arg(cert);
        }
        if let Some(key) = &self.opts.ssl_keyfile {
            cmd.arg("--ssl-keyfile").arg(key);
        }
        if self.opts.debug {
            cmd.arg("--debug");
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        cmd
    }

    /// Spawn the child process and start tasks that forward its stdout and
    /// stderr into this process's own tracing output, tagged so the two
    /// logs can be told apart in a tailed supervisor log.
    async fn spawn(self: &Arc<Self>) -> std::io::Result<()> {
        let mut cmd = self.command();
        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pipe_output(stdout, self.archetype, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pipe_output(stderr, self.archetype, true));
        }
        info!(archetype = %self.archetype, port = self.port, pid = child.id(), "spawned child process");
        *self.child.lock() = Some(child);
        Ok(())
    }

    /// Kill the current child (if any) and spawn a fresh one in its place.
    async fn respawn(self: &Arc<Self>) {
        let previous = self.child.lock().take();
        if let Some(mut child) = previous {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Err(err) = self.spawn().await {
            error!(archetype = %self.archetype, %err, "failed to respawn child process");
        }
    }

    fn health_label(&self) -> &'static str {
        if self.unreachable.load(Ordering::Relaxed) {
            "unreachable"
        } else if self.consecutive_failures.load(Ordering::Relaxed) > 0 {
            "degraded"
        } else {
            "ok"
        }
    }
}

async fn pipe_output<R>(reader: R, archetype: UserArchetype, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    warn!(target: "netprobe::child", archetype = archetype.tag(), "{line}");
                } else {
                    info!(target: "netprobe::child", archetype = archetype.tag(), "{line}");
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(target: "netprobe::child", archetype = archetype.tag(), %err, "child output stream error");
                break;
            }
        }
    }
}

/// Spawn one child per archetype, in fixed order, and wait briefly for each
/// to report healthy before moving on.
pub async fn start_all(
    archetypes: &[UserArchetype],
    base_port: u16,
    opts_for: impl Fn(UserArchetype) -> ChildSpawnOptions,
    http: &HttpClient,
) -> Vec<Arc<ChildProcess>> {
    let mut children = Vec::with_capacity(archetypes.len());
    for &archetype in archetypes {
        let port = archetype.default_port(base_port);
        let child = ChildProcess::new(archetype, port, opts_for(archetype));
        if let Err(err) = child.spawn().await {
            error!(%archetype, %err, "failed to spawn child process at startup");
        }
        children.push(child);
    }
    for child in &children {
        wait_until_healthy(child, http, Duration::from_secs(10)).await;
    }
    children
}

async fn wait_until_healthy(child: &Arc<ChildProcess>, http: &HttpClient, max_wait: Duration) {
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if fetch_json(http, child.port, "/health").await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    warn!(archetype = %child.archetype, "child did not report healthy within startup grace period");
}

/// Run the health-poll loop forever: check every child every
/// `config.health_poll_interval`, restarting any that exceed
/// `config.max_health_failures` consecutive failures.
pub async fn run_health_loop(children: Arc<Vec<Arc<ChildProcess>>>, config: SupervisorConfig, http: HttpClient) {
    let mut timer = tokio::time::interval(config.health_poll_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        for child in children.iter() {
            check_one(child, &config, &http).await;
        }
    }
}

async fn check_one(child: &Arc<ChildProcess>, config: &SupervisorConfig, http: &HttpClient) {
    match fetch_json(http, child.port, "/health").await {
        Ok(value) => {
            *child.last_health.lock() = Some(value);
            child.consecutive_failures.store(0, Ordering::Relaxed);
            child.restart_attempts.store(0, Ordering::Relaxed);
            child.unreachable.store(false, Ordering::Relaxed);
        }
        Err(err) => {
            let failures = child.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(archetype = %child.archetype, failures, %err, "child health check failed");
            if failures < config.max_health_failures {
                return;
            }
            let attempts = child.restart_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempts > config.max_restart_attempts {
                child.unreachable.store(true, Ordering::Relaxed);
                error!(archetype = %child.archetype, "giving up on child after exceeding max restart attempts");
                return;
            }
            let backoff = config.restart_backoff_base * 2u32.saturating_pow(attempts - 1);
            debug!(archetype = %child.archetype, attempt = attempts, backoff_ms = backoff.as_millis(), "respawning child");
            tokio::time::sleep(backoff).await;
            child.consecutive_failures.store(0, Ordering::Relaxed);
            child.respawn().await;
        }
    }
}

/// Fetch and parse a small JSON endpoint from one of this process's own
/// children, over loopback HTTP.
pub async fn fetch_json(client: &HttpClient, port: u16, path: &str) -> Result<Value, String> {
    let uri = format!("http://127.0.0.1:{port}{path}");
    let req = hyper::Request::get(uri)
        .body(Empty::<Bytes>::new())
        .map_err(|err| err.to_string())?;
    let resp = tokio::time::timeout(Duration::from_secs(3), client.request(req))
        .await
        .map_err(|_| "request timed out".to_string())?
        .map_err(|err| err.to_string())?;
    if resp.status() != hyper::StatusCode::OK {
        return Err(format!("unexpected status {}", resp.status()));
    }
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|err| err.to_string())?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|err| err.to_string())
}

/// Aggregate health report across every child, for `/virtual-household/health`.
#[must_use]
pub fn health_report(children: &[Arc<ChildProcess>]) -> Value {
    let entries: Vec<Value> = children
        .iter()
        .map(|c| {
            serde_json::json!({
                "archetype": c.archetype.tag(),
                "port": c.port,
                "health": c.health_label(),
                "restart_attempts": c.restart_attempts.load(Ordering::Relaxed),
                "detail": c.last_health.lock().clone(),
            })
        })
        .collect();
    serde_json::json!({ "children": entries })
}
