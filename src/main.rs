use std::fs::OpenOptions;
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tracing_subscriber::EnvFilter;

mod admin;
mod captcha;
mod challenge;
mod config;
mod dedup;
mod dispatch;
mod domains;
mod firewall;
mod helpers;
mod ipinfo;
mod metrics;
mod rules;
mod templates;
mod token;
mod upstream;

use captcha::CaptchaCache;
use dedup::Deduplicator;
use domains::DomainRegistry;
use firewall::Firewall;
use helpers::BufferPool;
use ipinfo::{IpInfoProvider, NoopIpInfo};
use metrics::ProxyMetrics;
use token::{SecretStore, TokenCache};
use upstream::UpstreamClient;

const CRASH_LOG: &str = "crash.log";
const WORKER_CAP: usize = 8;

/// Process-wide shared state, initialised once at bootstrap and
/// passed down by reference.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub ip_whitelist: Arc<std::collections::HashSet<String>>,
    pub firewall: Arc<Firewall>,
    pub domains: Arc<DomainRegistry>,
    pub secrets: Arc<SecretStore>,
    pub token_cache: Arc<TokenCache>,
    pub captcha_cache: Arc<CaptchaCache>,
    pub dedup: Arc<Deduplicator>,
    pub upstream: Arc<UpstreamClient>,
    pub metrics: Arc<ProxyMetrics>,
    pub templates: Arc<tera::Tera>,
    pub buffers: Arc<BufferPool>,
    pub ip_info: Arc<dyn IpInfoProvider>,
}

fn main() {
    let daemon = cli_daemon_flag();

    install_crash_hook();

    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(WORKER_CAP);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => fatal(&format!("failed to build runtime: {error}")),
    };

    if let Err(error) = runtime.block_on(run(daemon)) {
        fatal(&format!("{error:#}"));
    }
}

/// `-d` / `--daemon` turns the per-second monitor output off.
fn cli_daemon_flag() -> bool {
    std::env::args()
        .skip(1)
        .any(|arg| arg == "-d" || arg == "--daemon")
}

/// Bootstrap failures and panics end up in crash.log; the
/// per-request panic boundary keeps everything else alive.
fn install_crash_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        append_crash_log(&format!("panic: {info}"));
        default_hook(info);
    }));
}

fn append_crash_log(message: &str) {
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(CRASH_LOG)
    {
        let _ = writeln!(file, "[{}] {}", helpers::current_ts(), message);
    }
}

fn fatal(message: &str) -> ! {
    append_crash_log(message);
    eprintln!("{message}");
    std::process::exit(1);
}

async fn run(daemon: bool) -> anyhow::Result<()> {
    tracing::info!("starting proxy");

    let loaded = config::load("config.json")?;
    let ip_whitelist = config::load_ip_whitelist("ip_whitelist")?;
    tracing::info!(
        domains = loaded.domains.len(),
        whitelisted_ips = ip_whitelist.len(),
        "loaded config"
    );

    let now = helpers::current_ts();
    let state = AppState {
        firewall: Arc::new(Firewall::new(&loaded, now)),
        domains: Arc::new(DomainRegistry::new(&loaded.domains)),
        secrets: Arc::new(SecretStore::new()),
        token_cache: Arc::new(TokenCache::new()),
        captcha_cache: Arc::new(CaptchaCache::new()),
        dedup: Arc::new(Deduplicator::new(loaded.proxy.dedup_enabled)),
        upstream: Arc::new(UpstreamClient::new(Duration::from_secs(
            loaded.proxy.upstream_timeout_secs,
        ))?),
        metrics: Arc::new(ProxyMetrics::default()),
        templates: Arc::new(templates::init()?),
        buffers: Arc::new(BufferPool::new()),
        ip_info: Arc::new(NoopIpInfo),
        ip_whitelist: Arc::new(ip_whitelist),
        config: Arc::new(loaded),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(monitor_tick(state.clone(), daemon, shutdown_rx.clone()));
    tokio::spawn(secret_rotation(state.clone(), shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&state.dedup).run_sweeper(shutdown_rx));

    let port = state.config.proxy.port;
    let app = Router::new()
        .route("/", any(dispatch::handle))
        .route("/{*path}", any(dispatch::handle))
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic));

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| anyhow::anyhow!("binding {addr}: {error}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(true);
    })
    .await?;

    Ok(())
}

/// Request-boundary panic recovery: log, answer 500, keep serving.
fn handle_panic(error: Box<dyn std::any::Any + Send + 'static>) -> Response<Body> {
    let detail = if let Some(message) = error.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = error.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(%detail, "request handler panicked");
    append_crash_log(&format!("request panic: {detail}"));

    let mut response = Response::new(Body::from("500 Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// Once a second: advance the counter window, recompute per-domain
/// rates, drive stage escalation. The only writer of the window
/// timestamp.
async fn monitor_tick(state: AppState, daemon: bool, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = helpers::current_ts();
                let transitions = state.firewall.tick(now, &state.domains);
                for (domain, transition) in transitions {
                    match transition {
                        firewall::AttackTransition::Started { stage } => {
                            tracing::warn!(%domain, stage, "attack detected, stage raised");
                        }
                        firewall::AttackTransition::Ended { stage } => {
                            tracing::info!(%domain, stage, "attack over, stage restored");
                        }
                    }
                }
                if !daemon {
                    let firewall = state.firewall.read();
                    for (domain, data) in firewall.domains.iter() {
                        if data.requests_per_second > 0 {
                            tracing::info!(
                                target: "monitor",
                                %domain,
                                stage = data.stage,
                                rps = data.requests_per_second,
                                bypassed_rps = data.bypassed_per_second,
                                "status"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Rotate the per-stage secrets at the hour boundary. Requests issued
/// against the previous hour simply fail verification and get
/// re-challenged; there is deliberately no barrier with in-flight
/// requests.
async fn secret_rotation(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if state.secrets.due_for_rotation() {
                    state.secrets.rotate();
                    state.token_cache.clear();
                    tracing::info!("hourly secrets rotated, token cache cleared");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
