use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use axum::extract::{Path, Request, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, MethodRouter};
use axum::{Extension, Router};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::Level;

use appmgr_core::{
    AppMgrError, BoxError, OneShot, Phase, ResolvedConfig, Result, ServerConfig, StopHooks,
};

use crate::assets::{StaticAssets, STATIC_PREFIX};
use crate::listener;
use crate::loader::DataLoader;
use crate::markup::Markup;
use crate::routes::RouteTable;

/// Footer used when the footer file cannot be read.
pub const DEFAULT_FOOTER: &str =
    "<footer><p><strong>Warning:</strong> no site footer is configured for this server.</p></footer>";

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Where a started server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Address the listener is bound to.
    pub addr: SocketAddr,
    pub port: u16,
    /// Public base URL, without a trailing slash.
    pub site_url: String,
}

struct Serving {
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl Serving {
    /// Stops accepting, lets open connections finish, then releases the
    /// listener.
    async fn close(self) -> Result<()> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(served) => served.map_err(AppMgrError::from),
            Err(e) => Err(AppMgrError::from(std::io::Error::other(e))),
        }
    }
}

struct Inner {
    config: ResolvedConfig,
    routes: Arc<RouteTable>,
    assets: Arc<StaticAssets>,
    hooks: StopHooks,
    loader: Option<Arc<dyn DataLoader>>,
    /// Set by the first `start` (or by a `stop` that came first).
    started: AtomicBool,
    phase: watch::Sender<Phase>,
    readiness: OneShot<Endpoint>,
    /// Result of the one and only start attempt, shared by every caller.
    outcome: OneShot<Result<Endpoint>>,
    closed: OneShot<()>,
    footer: OnceLock<Markup>,
    serving: Mutex<Option<Serving>>,
    stopping: tokio::sync::Mutex<()>,
}

impl Inner {
    fn set_phase(&self, next: Phase) {
        let changed = self.phase.send_if_modified(|phase| {
            if phase.is_terminal() || *phase == next {
                return false;
            }
            *phase = next;
            true
        });
        if changed {
            tracing::debug!("Lifecycle phase -> {}", next);
        }
    }

    fn lock_serving(&self) -> MutexGuard<'_, Option<Serving>> {
        self.serving.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns an HTTP server from construction to shutdown.
///
/// The handle is cheap to clone; every clone drives the same server.
/// Handlers receive it through an `Extension<AppMgr>`.
///
/// ```ignore
/// let mgr = AppMgr::builder().with_port(0).build()?;
/// mgr.route("/", get(|| async { "<p>Hello</p>" }));
/// let endpoint = mgr.ready().await?;
/// // ...
/// mgr.stop().await?;
/// ```
#[derive(Clone)]
pub struct AppMgr {
    inner: Arc<Inner>,
}

impl AppMgr {
    pub fn builder() -> AppMgrBuilder {
        AppMgrBuilder::new()
    }

    /// Resolves `config` against the process environment and, unless
    /// `manual_start` is set, schedules `start`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        AppMgrBuilder::new().with_config(config).build()
    }

    fn from_resolved(config: ResolvedConfig, loader: Option<Arc<dyn DataLoader>>) -> Result<Self> {
        let runtime = if config.manual_start {
            None
        } else {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                AppMgrError::Configuration(
                    "automatic start needs a running Tokio runtime; set manual_start".to_string(),
                )
            })?;
            Some(handle)
        };

        let (phase, _) = watch::channel(Phase::Idle);
        let assets = Arc::new(StaticAssets::new(&config.root_directory));
        let mgr = AppMgr {
            inner: Arc::new(Inner {
                config,
                routes: Arc::new(RouteTable::new()),
                assets,
                hooks: StopHooks::new(),
                loader,
                started: AtomicBool::new(false),
                phase,
                readiness: OneShot::new(),
                outcome: OneShot::new(),
                closed: OneShot::new(),
                footer: OnceLock::new(),
                serving: Mutex::new(None),
                stopping: tokio::sync::Mutex::new(()),
            }),
        };

        if let Some(runtime) = runtime {
            let scheduled = mgr.clone();
            runtime.spawn(async move {
                // Give the caller's synchronous setup a chance to finish.
                tokio::task::yield_now().await;
                if let Err(err) = scheduled.start().await {
                    tracing::debug!("Automatic start did not complete: {}", err);
                }
            });
        }

        Ok(mgr)
    }

    /// Starts the server. Safe to call any number of times, concurrently.
    ///
    /// The first call marks the server as started before returning and
    /// spawns the bind; every call resolves to the outcome of that single
    /// attempt. Called outside a Tokio runtime it leaves the server
    /// untouched and resolves to a configuration error.
    pub fn start(&self) -> impl Future<Output = Result<Endpoint>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let refused = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                if !inner.started.swap(true, Ordering::AcqRel) {
                    let launcher = self.clone();
                    runtime.spawn(async move {
                        let outcome = launcher.launch().await;
                        launcher.inner.outcome.fire(outcome);
                    });
                }
                None
            }
            Err(_) => Some(AppMgrError::Configuration(
                "start needs a running Tokio runtime".to_string(),
            )),
        };
        async move {
            match refused {
                Some(err) => Err(err),
                None => inner.outcome.wait().await,
            }
        }
    }

    async fn launch(&self) -> Result<Endpoint> {
        let inner = &self.inner;
        inner.set_phase(Phase::Starting);

        if let Some(loader) = inner.loader.clone() {
            let mgr = self.clone();
            tokio::spawn(async move {
                if let Err(err) = loader.load(mgr).await {
                    tracing::error!("Data load failed: {}", err);
                }
            });
        }

        let footer = load_footer(&inner.config.footer_path).await;
        let _ = inner.footer.set(footer);

        let launched = self.bind_and_serve().await;
        match &launched {
            Ok(endpoint) => {
                inner.readiness.fire(endpoint.clone());
                inner.set_phase(Phase::Ready);
                if inner.config.silent {
                    tracing::debug!("Server started at {}", endpoint.site_url);
                } else {
                    tracing::info!("Server started at {} (bound to {})", endpoint.site_url, endpoint.addr);
                }
            }
            Err(err) => {
                inner.set_phase(Phase::Failed);
                tracing::error!("Server failed to start: {}", err);
            }
        }
        launched
    }

    async fn bind_and_serve(&self) -> Result<Endpoint> {
        let config = &self.inner.config;
        let addr = listener::resolve_addr(&config.host, config.port).await?;
        let listener = listener::bind(addr)?;
        let local = listener.local_addr().map_err(|e| AppMgrError::Bind {
            addr,
            source: Arc::new(e),
        })?;

        let site_url = config
            .site_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", local.port()));
        let endpoint = Endpoint {
            addr: local,
            port: local.port(),
            site_url,
        };

        let app = self.build_app();
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });
        *self.inner.lock_serving() = Some(Serving { shutdown, task });

        Ok(endpoint)
    }

    /// The router handed to the listener: static assets, then the live
    /// route table, with the context injector and access log around both.
    fn build_app(&self) -> Router {
        let state = AdapterState {
            routes: Arc::clone(&self.inner.routes),
            assets: Arc::clone(&self.inner.assets),
        };
        let level = if self.inner.config.production_mode {
            Level::INFO
        } else {
            Level::DEBUG
        };

        Router::new()
            .route(&format!("{STATIC_PREFIX}/{{*path}}"), get(serve_asset))
            .fallback(dispatch)
            .with_state(state)
            .layer(Extension(self.clone()))
            .layer(TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(level)))
    }

    /// Shuts the server down.
    ///
    /// Runs the stop hooks in registration order, then closes the listener,
    /// then fires the closed signal. A failing hook aborts the sequence and
    /// leaves the listener open; calling `stop` again resumes with the
    /// hooks after the one that failed.
    ///
    /// If a start is still binding, `stop` waits for the bind to finish and
    /// then closes the new listener. Once closed, `stop` returns `Ok(())`.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let _serialized = inner.stopping.lock().await;
        if inner.closed.is_fired() {
            return Ok(());
        }

        if !inner.started.swap(true, Ordering::AcqRel) {
            inner.outcome.fire(Err(AppMgrError::Closed));
        } else {
            let _ = inner.outcome.wait().await;
        }

        inner.set_phase(Phase::Stopping);
        let ran = inner.hooks.drain().await?;
        tracing::debug!("Ran {} stop hooks", ran);

        let serving = inner.lock_serving().take();
        if let Some(serving) = serving {
            serving.close().await?;
        }

        inner.closed.fire(());
        inner.set_phase(Phase::Closed);
        if inner.config.silent {
            tracing::debug!("Server closed");
        } else {
            tracing::info!("Server closed");
        }
        Ok(())
    }

    /// Waits for the outcome of the start attempt.
    ///
    /// Unlike waiting on [`AppMgr::readiness`], this also returns when the
    /// bind failed. With `manual_start` it waits until someone calls
    /// `start`.
    pub async fn ready(&self) -> Result<Endpoint> {
        self.inner.outcome.wait().await
    }

    /// Fires once the listener is bound and the site URL is fixed.
    pub fn readiness(&self) -> &OneShot<Endpoint> {
        &self.inner.readiness
    }

    /// Fires once hooks have run and the listener is closed.
    pub fn closed(&self) -> &OneShot<()> {
        &self.inner.closed
    }

    pub async fn wait_closed(&self) {
        self.inner.closed.wait().await
    }

    /// Registers a route. Takes effect immediately, even while serving.
    pub fn route(&self, path: &str, method_router: MethodRouter) -> &Self {
        if self.phase() == Phase::Ready {
            tracing::warn!("Route {} registered after the server started", path);
        }
        self.inner.routes.route(path, method_router);
        self
    }

    pub fn merge(&self, router: Router) -> &Self {
        if self.phase() == Phase::Ready {
            tracing::warn!("Routes merged after the server started");
        }
        self.inner.routes.merge(router);
        self
    }

    /// Registers a teardown action run by `stop`, after every hook
    /// registered before it.
    pub fn on_stop<F, Fut>(&self, name: impl Into<String>, action: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.inner.hooks.register(name, action)
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.readiness.get()
    }

    /// Public base URL. `None` until the server is ready.
    pub fn site_url(&self) -> Option<String> {
        self.endpoint().map(|endpoint| endpoint.site_url)
    }

    /// The bound port once ready, the configured one before.
    pub fn port(&self) -> u16 {
        self.endpoint()
            .map(|endpoint| endpoint.port)
            .unwrap_or(self.inner.config.port)
    }

    pub fn proxied(&self) -> bool {
        self.inner.config.proxied
    }

    /// Footer fragment, available once `start` has run.
    pub fn footer(&self) -> Option<Markup> {
        self.inner.footer.get().cloned()
    }

    /// Address of the client behind a request.
    ///
    /// When the server is proxied the leftmost `X-Forwarded-For` entry is
    /// trusted; otherwise the socket peer is used.
    pub fn client_ip(&self, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
        if self.inner.config.proxied {
            let forwarded = headers
                .get(FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .and_then(|first| first.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return ip;
            }
        }
        peer.ip()
    }
}

impl std::fmt::Debug for AppMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppMgr")
            .field("phase", &self.phase())
            .field("endpoint", &self.endpoint())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[derive(Clone)]
struct AdapterState {
    routes: Arc<RouteTable>,
    assets: Arc<StaticAssets>,
}

async fn serve_asset(State(state): State<AdapterState>, Path(path): Path<String>) -> Response {
    state.assets.serve(&path).await
}

async fn dispatch(State(state): State<AdapterState>, request: Request) -> Response {
    state.routes.dispatch(request).await
}

async fn load_footer(path: &FsPath) -> Markup {
    match tokio::fs::read_to_string(path).await {
        Ok(html) => Markup::trusted(html),
        Err(e) => {
            tracing::debug!("No footer at {} ({}), using the built-in one", path.display(), e);
            Markup::trusted(DEFAULT_FOOTER)
        }
    }
}

/// Fluent construction of an [`AppMgr`].
pub struct AppMgrBuilder {
    config: ServerConfig,
    env: Option<Box<dyn Fn(&str) -> Option<String> + Send + Sync>>,
    loader: Option<Arc<dyn DataLoader>>,
}

impl AppMgrBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            env: None,
            loader: None,
        }
    }

    /// Replaces the whole raw configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    /// `0` asks the OS for a free port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn with_site_url(mut self, site_url: impl Into<String>) -> Self {
        self.config.site_url = Some(site_url.into());
        self
    }

    pub fn with_proxied(mut self, proxied: bool) -> Self {
        self.config.proxied = Some(proxied);
        self
    }

    pub fn with_root_directory(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root_directory = Some(root.into());
        self
    }

    pub fn with_footer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.footer_path = Some(path.into());
        self
    }

    pub fn with_production_mode(mut self, enabled: bool) -> Self {
        self.config.production_mode = Some(enabled);
        self
    }

    pub fn manual_start(mut self, manual: bool) -> Self {
        self.config.manual_start = manual;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.config.silent = silent;
        self
    }

    pub fn with_loader(mut self, loader: impl DataLoader) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Replaces the process environment as the fallback source.
    pub fn with_env<E>(mut self, env: E) -> Self
    where
        E: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Some(Box::new(env));
        self
    }

    pub fn build(self) -> Result<AppMgr> {
        let resolved = match self.env {
            Some(env) => self.config.resolve_with(|key| env(key))?,
            None => self.config.resolve()?,
        };
        AppMgr::from_resolved(resolved, self.loader)
    }
}

impl Default for AppMgrBuilder {
    fn default() -> Self {
        Self::new()
    }
}
