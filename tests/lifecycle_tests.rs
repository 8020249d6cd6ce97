//! # Server Lifecycle Tests
//!
//! Drives real listeners end to end: deferred and manual start, idempotent
//! start, dynamic ports, readiness ordering, ordered shutdown, the closed
//! signal, static assets, and the per-request context.

use appmgr::{markup, AppMgr, AppMgrError, BoxError, Payload, Phase};
use axum::extract::ConnectInfo;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::Extension;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A manager on a dynamic port that will not start on its own and reads
/// no footer or environment from the host.
fn manual(root: &Path) -> AppMgr {
    AppMgr::builder()
        .with_port(0)
        .with_root_directory(root)
        .with_footer_path(root.join("footer.html"))
        .with_env(|_| None)
        .manual_start(true)
        .silent(true)
        .build()
        .unwrap()
}

fn static_root() -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("static");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("ping.txt"), "pong\n").unwrap();
    std::fs::write(dir.join("rdf.trig"), "<a> <b> <c>\n").unwrap();
    root
}

async fn fetch(url: &str) -> reqwest::Response {
    reqwest::get(url).await.expect("request failed")
}

fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

/// Register a route, start, fetch it, stop, and see the closed signal.
#[tokio::test]
async fn test_start_serve_stop() {
    let t = Instant::now();
    let root = static_root();
    let mgr = manual(root.path());
    mgr.route("/hello", get(|| async { Payload::from("<p>hello</p>") }));

    assert_eq!(mgr.phase(), Phase::Idle);
    assert_eq!(mgr.site_url(), None, "no public url before readiness");

    let endpoint = mgr.start().await.unwrap();
    assert_eq!(mgr.phase(), Phase::Ready);
    assert_eq!(mgr.site_url().as_deref(), Some(endpoint.site_url.as_str()));

    let response = fetch(&format!("{}/hello", endpoint.site_url)).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "<p>hello</p>");

    mgr.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), mgr.wait_closed())
        .await
        .expect("closed signal must fire");
    assert_eq!(mgr.phase(), Phase::Closed);

    println!("test_start_serve_stop: Testing Overhead = {:?}", t.elapsed());
}

/// Port 0 resolves to a real port and the computed url embeds it.
#[tokio::test]
async fn test_dynamic_port_resolution() {
    let root = static_root();
    let mgr = manual(root.path());
    assert_eq!(mgr.port(), 0);

    let endpoint = mgr.start().await.unwrap();

    assert_ne!(endpoint.port, 0);
    assert_eq!(endpoint.addr.port(), endpoint.port);
    assert_eq!(mgr.port(), endpoint.port);
    assert_eq!(endpoint.site_url, format!("http://localhost:{}", endpoint.port));
    mgr.stop().await.unwrap();
}

/// Sequential and concurrent starts share one bind and one outcome.
#[tokio::test]
async fn test_start_is_idempotent() {
    let root = static_root();
    let mgr = manual(root.path());

    let first = mgr.start();
    assert!(mgr.is_started(), "started is set before the future is polled");
    let second = mgr.start();
    let (first, second) = tokio::join!(first, second);
    let third = mgr.start().await.unwrap();

    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(first, third);
    mgr.stop().await.unwrap();
}

/// A request issued the moment readiness fires is served.
#[tokio::test]
async fn test_readiness_means_accepting() {
    let root = static_root();
    let mgr = manual(root.path());
    mgr.route("/ok", get(|| async { "ok" }));

    let gate = mgr.clone();
    let observer = tokio::spawn(async move {
        let endpoint = gate.readiness().wait().await;
        fetch(&format!("{}/ok", endpoint.site_url)).await.text().await.unwrap()
    });

    mgr.start().await.unwrap();
    assert_eq!(observer.await.unwrap(), "ok");
    mgr.stop().await.unwrap();
}

/// Without `manual_start`, routes registered right after construction are
/// served once the scheduled start has run.
#[tokio::test]
async fn test_automatic_start() {
    let root = static_root();
    let mgr = AppMgr::builder()
        .with_root_directory(root.path())
        .with_footer_path(root.path().join("footer.html"))
        .with_env(|key| (key == "PORT").then(|| "0".to_string()))
        .silent(true)
        .build()
        .unwrap();
    mgr.route(
        "/hello",
        get(|| async { markup!("<p>{}</p>", "hello") }),
    );
    assert_eq!(mgr.site_url(), None);

    let endpoint = tokio::time::timeout(Duration::from_secs(5), mgr.ready())
        .await
        .expect("automatic start must run")
        .unwrap();

    let body = fetch(&format!("{}/hello", endpoint.site_url)).await.text().await.unwrap();
    assert_eq!(body, "<p>hello</p>");
    mgr.stop().await.unwrap();
}

/// Routes added while serving are picked up by the next request.
#[tokio::test]
async fn test_route_registered_after_start() {
    let root = static_root();
    let mgr = manual(root.path());
    let endpoint = mgr.start().await.unwrap();

    let missing = fetch(&format!("{}/late", endpoint.site_url)).await;
    assert_eq!(missing.status(), 404);

    mgr.route("/late", get(|| async { "late" }));
    let found = fetch(&format!("{}/late", endpoint.site_url)).await;
    assert_eq!(found.text().await.unwrap(), "late");
    mgr.stop().await.unwrap();
}

/// Stop hooks that append to a shared log run strictly one after another.
#[tokio::test]
async fn test_stop_hooks_run_in_order() {
    let root = static_root();
    let mgr = manual(root.path());
    mgr.start().await.unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["hook1", "hook2"] {
        let log = log.clone();
        mgr.on_stop(name, move || async move {
            log.lock().unwrap().push(format!("{name}-start"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            log.lock().unwrap().push(format!("{name}-end"));
            Ok(())
        })
        .unwrap();
    }

    mgr.stop().await.unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        ["hook1-start", "hook1-end", "hook2-start", "hook2-end"]
    );

    let late = mgr.on_stop("late", || async { Ok(()) });
    assert!(matches!(late, Err(AppMgrError::HookRejected(_))));
}

/// After stop the closed signal has fired once and the port refuses
/// connections.
#[tokio::test]
async fn test_stop_closes_listener() {
    let root = static_root();
    let mgr = manual(root.path());
    let endpoint = mgr.start().await.unwrap();
    let addr = SocketAddr::from(([127, 0, 0, 1], endpoint.port));
    assert!(TcpStream::connect(addr).is_ok());

    mgr.stop().await.unwrap();

    assert!(mgr.closed().is_fired());
    assert!(!mgr.closed().fire(()), "closed must only fire once");
    assert!(TcpStream::connect(addr).is_err(), "listener must be closed");

    mgr.stop().await.unwrap();
    assert_eq!(mgr.phase(), Phase::Closed);
}

/// A failing hook aborts shutdown with the listener still open; the next
/// stop resumes with the remaining hooks and then closes.
#[tokio::test]
async fn test_hook_failure_aborts_stop() {
    let root = static_root();
    let mgr = manual(root.path());
    mgr.route("/ok", get(|| async { "ok" }));
    let endpoint = mgr.start().await.unwrap();

    let cleaned = Arc::new(Mutex::new(false));
    mgr.on_stop("broken", || async { Err::<(), BoxError>("disk full".into()) })
        .unwrap();
    let flag = cleaned.clone();
    mgr.on_stop("cleanup", move || async move {
        *flag.lock().unwrap() = true;
        Ok(())
    })
    .unwrap();

    let err = mgr.stop().await.unwrap_err();
    assert!(matches!(&err, AppMgrError::Hook { name, .. } if name == "broken"));
    assert!(!mgr.closed().is_fired());
    assert!(!*cleaned.lock().unwrap());
    let still_up = fetch(&format!("{}/ok", endpoint.site_url)).await;
    assert_eq!(still_up.status(), 200);

    mgr.stop().await.unwrap();
    assert!(*cleaned.lock().unwrap());
    assert!(mgr.closed().is_fired());
}

/// Stopping a server that never started still runs hooks and closes; a
/// later start reports the shutdown.
#[tokio::test]
async fn test_stop_before_start() {
    let root = static_root();
    let mgr = manual(root.path());
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    mgr.on_stop("flag", move || async move {
        *flag.lock().unwrap() = true;
        Ok(())
    })
    .unwrap();

    mgr.stop().await.unwrap();

    assert!(*ran.lock().unwrap());
    assert!(mgr.closed().is_fired());
    assert!(!mgr.readiness().is_fired());
    assert!(matches!(mgr.start().await, Err(AppMgrError::Closed)));
}

/// Stop issued while a start is in flight waits for the bind and then
/// closes the listener.
#[tokio::test]
async fn test_stop_during_start() {
    let root = static_root();
    let mgr = manual(root.path());

    let starting = mgr.start();
    mgr.stop().await.unwrap();

    let endpoint = starting.await.unwrap();
    assert!(mgr.closed().is_fired());
    let addr = SocketAddr::from(([127, 0, 0, 1], endpoint.port));
    assert!(TcpStream::connect(addr).is_err());
}

/// An occupied port fails the start; readiness never fires and `ready`
/// reports the failure instead of hanging.
#[tokio::test]
async fn test_bind_failure() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let root = static_root();
    let mgr = AppMgr::builder()
        .with_port(port)
        .with_root_directory(root.path())
        .with_footer_path(root.path().join("footer.html"))
        .with_env(|_| None)
        .manual_start(true)
        .silent(true)
        .build()
        .unwrap();

    let err = mgr.start().await.unwrap_err();
    assert!(matches!(&err, AppMgrError::Bind { addr, .. } if addr.port() == port));
    assert!(mgr.is_started());
    assert!(!mgr.readiness().is_fired());
    assert_eq!(mgr.phase(), Phase::Failed);
    assert!(matches!(mgr.ready().await, Err(AppMgrError::Bind { .. })));
    assert!(matches!(mgr.start().await, Err(AppMgrError::Bind { .. })));

    mgr.stop().await.unwrap();
    assert!(mgr.closed().is_fired());
}

/// Before start the port refuses connections; after start the static
/// asset is served in full.
#[tokio::test]
async fn test_static_before_and_after_start() {
    let root = static_root();
    let port = free_port();
    let mgr = AppMgr::builder()
        .with_port(port)
        .with_root_directory(root.path())
        .with_footer_path(root.path().join("footer.html"))
        .with_env(|_| None)
        .manual_start(true)
        .silent(true)
        .build()
        .unwrap();
    let url = format!("http://127.0.0.1:{port}/static/ping");

    let early = reqwest::get(url.as_str()).await;
    assert!(early.is_err_and(|e| e.is_connect()), "must fail cleanly before start");

    mgr.start().await.unwrap();
    let response = fetch(&url).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "pong\n");
    mgr.stop().await.unwrap();
}

#[tokio::test]
async fn test_static_trig_content_type() {
    let root = static_root();
    let mgr = manual(root.path());
    let endpoint = mgr.start().await.unwrap();

    let response = fetch(&format!("{}/static/rdf", endpoint.site_url)).await;
    assert_eq!(response.headers()["content-type"], "application/trig");
    assert_eq!(response.text().await.unwrap(), "<a> <b> <c>\n");

    let missing = fetch(&format!("{}/static/nothing", endpoint.site_url)).await;
    assert_eq!(missing.status(), 404);
    mgr.stop().await.unwrap();
}

/// Markup is sent as raw HTML, structured values as JSON, and an absent
/// value fails only that request.
#[tokio::test]
async fn test_response_normalization_over_http() {
    let root = static_root();
    let mgr = manual(root.path());
    mgr.route("/markup", get(|| async { Payload::from(markup!("<p>{}</p>", "hello")) }))
        .route("/js", get(|| async { Payload::json(&serde_json::json!({ "x": 1, "y": 2 })).unwrap() }))
        .route("/nothing", get(|| async { Payload::from(None::<String>) }));
    let endpoint = mgr.start().await.unwrap();

    let markup = fetch(&format!("{}/markup", endpoint.site_url)).await;
    assert!(markup.headers()["content-type"].to_str().unwrap().starts_with("text/html"));
    assert_eq!(markup.text().await.unwrap(), "<p>hello</p>");

    let js = fetch(&format!("{}/js", endpoint.site_url)).await;
    assert!(js.headers()["content-type"].to_str().unwrap().starts_with("application/json"));
    let value: serde_json::Value = serde_json::from_str(&js.text().await.unwrap()).unwrap();
    assert_eq!(value, serde_json::json!({ "x": 1, "y": 2 }));

    let nothing = fetch(&format!("{}/nothing", endpoint.site_url)).await;
    assert_eq!(nothing.status(), 500);

    let markup_again = fetch(&format!("{}/markup", endpoint.site_url)).await;
    assert_eq!(markup_again.status(), 200, "the server survives a bad handler");
    mgr.stop().await.unwrap();
}

/// Handlers reach the manager through the request context.
#[tokio::test]
async fn test_handlers_see_the_manager() {
    let root = static_root();
    let mgr = manual(root.path());
    mgr.route(
        "/about",
        get(|Extension(mgr): Extension<AppMgr>| async move {
            markup!("<p>This is {}</p>", mgr.site_url().unwrap_or_default())
        }),
    );
    let endpoint = mgr.start().await.unwrap();

    let body = fetch(&format!("{}/about", endpoint.site_url)).await.text().await.unwrap();
    assert_eq!(body, format!("<p>This is {}</p>", endpoint.site_url));
    mgr.stop().await.unwrap();
}

/// Forwarded addresses are honoured only when the server is proxied.
#[tokio::test]
async fn test_client_ip_honours_proxied_flag() {
    let root = static_root();
    let handler = |Extension(mgr): Extension<AppMgr>,
                   ConnectInfo(peer): ConnectInfo<SocketAddr>,
                   headers: HeaderMap| async move {
        mgr.client_ip(&headers, peer).to_string()
    };

    let proxied = AppMgr::builder()
        .with_port(0)
        .with_proxied(true)
        .with_root_directory(root.path())
        .with_footer_path(root.path().join("footer.html"))
        .with_env(|_| None)
        .manual_start(true)
        .silent(true)
        .build()
        .unwrap();
    let direct = manual(root.path());
    proxied.route("/ip", get(handler));
    direct.route("/ip", get(handler));

    let client = reqwest::Client::new();
    for (mgr, expected) in [(&proxied, "203.0.113.7"), (&direct, "127.0.0.1")] {
        let endpoint = mgr.start().await.unwrap();
        let body = client
            .get(format!("http://127.0.0.1:{}/ip", endpoint.port))
            .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, expected);
        mgr.stop().await.unwrap();
    }
}

/// The data loader is started by `start` without delaying readiness.
#[tokio::test]
async fn test_data_loader_runs_in_background() {
    let root = static_root();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<u16>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));

    let mgr = AppMgr::builder()
        .with_port(0)
        .with_root_directory(root.path())
        .with_footer_path(root.path().join("footer.html"))
        .with_env(|_| None)
        .manual_start(true)
        .silent(true)
        .with_loader(move |mgr: AppMgr| {
            let release = release_rx.lock().unwrap().take();
            let done = done_tx.lock().unwrap().take();
            async move {
                if let Some(release) = release {
                    let _ = release.await;
                }
                let port = mgr.readiness().wait().await.port;
                if let Some(done) = done {
                    let _ = done.send(port);
                }
                Ok::<(), BoxError>(())
            }
        })
        .build()
        .unwrap();

    let endpoint = tokio::time::timeout(Duration::from_secs(5), mgr.start())
        .await
        .expect("start must not wait for the loader")
        .unwrap();

    release_tx.send(()).unwrap();
    assert_eq!(done_rx.await.unwrap(), endpoint.port);
    mgr.stop().await.unwrap();
}

/// The footer file is read at start; without it the built-in fragment is
/// used.
#[tokio::test]
async fn test_footer_loading() {
    let root = static_root();

    let fallback = manual(root.path());
    assert_eq!(fallback.footer(), None);
    fallback.start().await.unwrap();
    assert_eq!(
        fallback.footer().unwrap().as_str(),
        appmgr::server::DEFAULT_FOOTER
    );
    fallback.stop().await.unwrap();

    std::fs::write(root.path().join("footer.html"), "<footer>custom</footer>").unwrap();
    let custom = manual(root.path());
    custom.start().await.unwrap();
    assert_eq!(custom.footer().unwrap().as_str(), "<footer>custom</footer>");
    custom.stop().await.unwrap();
}

/// Automatic start cannot be scheduled without a runtime.
#[test]
fn test_automatic_start_requires_runtime() {
    let err = AppMgr::builder()
        .with_port(0)
        .with_env(|_| None)
        .build()
        .unwrap_err();
    assert!(matches!(err, AppMgrError::Configuration(_)));
}

/// A stop abandoned by its caller mid-hook does not lose the hook: the
/// next stop finishes it before the listener closes.
#[tokio::test]
async fn test_abandoned_stop_resumes_running_hook() {
    let root = static_root();
    let mgr = manual(root.path());
    let endpoint = mgr.start().await.unwrap();
    let addr = SocketAddr::from(([127, 0, 0, 1], endpoint.port));

    let flushed = Arc::new(Mutex::new(0));
    let counter = flushed.clone();
    mgr.on_stop("flush", move || async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        *counter.lock().unwrap() += 1;
        Ok(())
    })
    .unwrap();

    let abandoned = tokio::time::timeout(Duration::from_millis(20), mgr.stop()).await;
    assert!(abandoned.is_err(), "first stop should still be inside the hook");
    assert!(!mgr.closed().is_fired());
    assert!(TcpStream::connect(addr).is_ok(), "listener must stay open");

    mgr.stop().await.unwrap();
    assert_eq!(*flushed.lock().unwrap(), 1);
    assert!(mgr.closed().is_fired());
    assert!(TcpStream::connect(addr).is_err());
}

/// Concurrent stops all succeed while hooks run and closed fires once.
#[tokio::test]
async fn test_concurrent_stops_are_serialized() {
    let root = static_root();
    let mgr = manual(root.path());
    mgr.start().await.unwrap();

    let runs = Arc::new(Mutex::new(0));
    let counter = runs.clone();
    mgr.on_stop("count", move || async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        *counter.lock().unwrap() += 1;
        Ok(())
    })
    .unwrap();

    let (a, b, c) = tokio::join!(mgr.stop(), mgr.stop(), mgr.stop());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(*runs.lock().unwrap(), 1);
    assert!(mgr.closed().is_fired());
    assert!(!mgr.closed().fire(()), "closed must only fire once");
    assert_eq!(mgr.phase(), Phase::Closed);
}

#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Registering a route once the server is ready is logged as a warning;
/// registering before start is not.
#[tokio::test]
async fn test_late_route_registration_warns() {
    let captured = CapturedLog::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let root = static_root();
    let mgr = manual(root.path());
    mgr.route("/early", get(|| async { "early" }));
    mgr.start().await.unwrap();
    assert!(captured.0.lock().unwrap().is_empty());

    mgr.route("/late", get(|| async { "late" }));
    let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    assert!(logged.contains("WARN"), "{logged}");
    assert!(logged.contains("/late"), "{logged}");
    assert!(!logged.contains("/early"), "{logged}");

    mgr.stop().await.unwrap();
}

/// A manual start from synchronous code reports the missing runtime
/// instead of panicking, and leaves the server startable.
#[test]
fn test_start_outside_runtime_is_refused() {
    let root = static_root();
    let mgr = manual(root.path());

    let pending = mgr.start();
    assert!(!mgr.is_started());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let err = runtime.block_on(pending).unwrap_err();
    assert!(matches!(err, AppMgrError::Configuration(_)));

    runtime.block_on(async {
        mgr.start().await.unwrap();
        mgr.stop().await.unwrap();
    });
}
