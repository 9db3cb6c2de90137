use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use drive_lib::{
    DriveError, DriveResult, GDriveClient, GDriveConfig, MemoryObjectStore, ObjectStore,
    RetryPolicy, RetryingStore, DEFAULT_MAX_OUTBOUND,
};
use drive_meta::{
    sweep_once, DriveFs, DriveFsConfig, LockMgr, LockMgrConfig, Maintenance,
    DEFAULT_SWEEP_INTERVAL,
};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::Instant;

use crate::dav_handler::handle_dav;

pub const DEFAULT_ADDR: &str = ":8765";
pub const ACCESS_TOKEN_ENV: &str = "GDRIVE_ACCESS_TOKEN";

#[derive(Debug, Clone, Default)]
pub struct DavDaemonRunOptions {
    pub config_path: Option<PathBuf>,
    pub addr: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub backend: Option<StoreBackend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Gdrive,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gdrive" => Ok(StoreBackend::Gdrive),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown backend '{}', expected gdrive or memory", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DavDaemonConfig {
    #[serde(alias = "listen", alias = "address")]
    pub addr: String,
    pub backend: StoreBackend,
    pub client_id: String,
    pub client_secret: String,
    /// OAuth access token. Falls back to `GDRIVE_ACCESS_TOKEN`.
    pub access_token: Option<String>,
    pub api_base: Option<String>,
    #[serde(alias = "rate_limit")]
    pub rate_per_sec: f64,
    #[serde(alias = "rate_burst")]
    pub burst: u32,
    #[serde(alias = "outbound_concurrency")]
    pub max_outbound: usize,
    pub sweep_interval_secs: u64,
    pub retry: RetryPolicy,
    #[serde(alias = "cache")]
    pub fs: DriveFsConfig,
    pub locks: LockMgrConfig,
}

impl Default for DavDaemonConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            backend: StoreBackend::Gdrive,
            client_id: String::new(),
            client_secret: String::new(),
            access_token: None,
            api_base: None,
            rate_per_sec: 10.0,
            burst: 1000,
            max_outbound: DEFAULT_MAX_OUTBOUND,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            retry: RetryPolicy::default(),
            fs: DriveFsConfig::default(),
            locks: LockMgrConfig::default(),
        }
    }
}

impl DavDaemonConfig {
    /// Socket address to bind; a bare `:port` listens on all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }

    fn validate(&self) -> DriveResult<()> {
        if self.backend == StoreBackend::Gdrive {
            if self.client_id.is_empty() {
                return Err(DriveError::InvalidParam(
                    "--client-id is not specified".to_string(),
                ));
            }
            if self.client_secret.is_empty() {
                return Err(DriveError::InvalidParam(
                    "--client-secret is not specified".to_string(),
                ));
            }
        }
        if self.rate_per_sec <= 0.0 || self.burst == 0 {
            return Err(DriveError::InvalidParam(format!(
                "invalid rate limit: {} per sec, burst {}",
                self.rate_per_sec, self.burst
            )));
        }
        Ok(())
    }
}

pub(crate) fn read_json_config<T: DeserializeOwned>(path: &Path) -> DriveResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DriveError::InvalidParam(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| DriveError::InvalidParam(format!("parse {} failed: {}", path.display(), e)))
}

/// Config file values with command-line overrides applied, validated.
pub fn load_config(options: &DavDaemonRunOptions) -> DriveResult<DavDaemonConfig> {
    let mut config: DavDaemonConfig = match &options.config_path {
        Some(path) => read_json_config(path)?,
        None => DavDaemonConfig::default(),
    };
    if let Some(addr) = &options.addr {
        config.addr = addr.clone();
    }
    if let Some(client_id) = &options.client_id {
        config.client_id = client_id.clone();
    }
    if let Some(client_secret) = &options.client_secret {
        config.client_secret = client_secret.clone();
    }
    if let Some(backend) = options.backend {
        config.backend = backend;
    }
    config.validate()?;
    Ok(config)
}

/// Token bucket of `burst` tokens, refilled at `rate` per second, initially full.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = burst as f64;
        Self {
            rate,
            burst,
            bucket: Mutex::new((burst, Instant::now())),
        }
    }

    pub fn allow(&self) -> bool {
        let Ok(mut bucket) = self.bucket.lock() else {
            return false;
        };
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.1).as_secs_f64();
        bucket.0 = (bucket.0 + elapsed * self.rate).min(self.burst);
        bucket.1 = now;
        if bucket.0 >= 1.0 {
            bucket.0 -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct DavState {
    pub fs: DriveFs,
    pub locks: Arc<LockMgr>,
    pub limiter: RateLimiter,
}

impl DavState {
    pub fn new(store: Arc<dyn ObjectStore>, config: &DavDaemonConfig) -> Self {
        Self {
            fs: DriveFs::new(store, config.fs.clone()),
            locks: Arc::new(LockMgr::new(config.locks.clone())),
            limiter: RateLimiter::new(config.rate_per_sec, config.burst),
        }
    }
}

fn resolve_access_token(config: &DavDaemonConfig) -> DriveResult<String> {
    if let Some(token) = config.access_token.as_ref().filter(|t| !t.is_empty()) {
        return Ok(token.clone());
    }
    match std::env::var(ACCESS_TOKEN_ENV) {
        Ok(token) if !token.is_empty() => Ok(token),
        _ => Err(DriveError::PermissionDenied(format!(
            "no access token for client {}: set access_token in the config or {}",
            config.client_id, ACCESS_TOKEN_ENV
        ))),
    }
}

/// The configured backend wrapped in the retry and outbound-concurrency layer.
pub async fn build_store(config: &DavDaemonConfig) -> DriveResult<Arc<dyn ObjectStore>> {
    let raw: Arc<dyn ObjectStore> = match config.backend {
        StoreBackend::Memory => {
            info!("using in-memory object store");
            Arc::new(MemoryObjectStore::new())
        }
        StoreBackend::Gdrive => {
            let mut gdrive_config = GDriveConfig::new(resolve_access_token(config)?);
            if let Some(api_base) = &config.api_base {
                gdrive_config.api_base = api_base.clone();
            }
            let client = config
                .retry
                .run("connect", || GDriveClient::connect(gdrive_config.clone()))
                .await?;
            Arc::new(client)
        }
    };
    Ok(Arc::new(RetryingStore::new(
        raw,
        config.retry.clone(),
        config.max_outbound,
    )))
}

async fn rate_limit(State(state): State<Arc<DavState>>, req: Request, next: Next) -> Response {
    if !state.limiter.allow() {
        warn!("rate limit: rejecting {} {}", req.method(), req.uri().path());
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }
    next.run(req).await
}

async fn gc_handler(State(state): State<Arc<DavState>>) -> StatusCode {
    let stats = sweep_once(&state.fs, &state.locks);
    info!(
        "GC: dropped {} listings, {} locks",
        stats.listings, stats.locks
    );
    StatusCode::OK
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

pub fn build_router(state: Arc<DavState>) -> Router {
    Router::new()
        .route("/debug/gc", any(gc_handler))
        .route("/favicon.ico", any(not_found_handler))
        .fallback(handle_dav)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

pub fn run_dav_daemon(options: DavDaemonRunOptions) -> DriveResult<()> {
    let config = load_config(&options)?;
    let runtime = Runtime::new().map_err(|e| DriveError::Internal(e.to_string()))?;
    runtime.block_on(async move {
        let store = build_store(&config).await?;
        let state = Arc::new(DavState::new(store, &config));
        let _maintenance = Maintenance::start(
            state.fs.clone(),
            state.locks.clone(),
            Duration::from_secs(config.sweep_interval_secs.max(1)),
        );

        let addr = config.listen_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DriveError::Internal(format!("bind {} failed: {}", addr, e)))?;
        info!("Listening on: {}", addr);
        axum::serve(listener, build_router(state))
            .await
            .map_err(|e| DriveError::Internal(format!("serve failed: {}", e)))
    })
}
