//! Small site on top of `AppMgr`.
//!
//! ```text
//! # debug logging and a fixed port
//! RUST_LOG=debug PORT=8123 cargo run --example example_server
//!
//! # dynamically assigned port
//! PORT=0 cargo run --example example_server
//!
//! # behind a proxy that serves the site under another url
//! PORT=1234 SITEURL=https://example.com/foo PROXIED=1 APP_ENV=production \
//!     cargo run --example example_server
//! ```

use std::collections::HashMap;

use appmgr::{markup, AppMgr, Payload, ServerConfig};
use axum::extract::Query;
use axum::routing::get;
use axum::Extension;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mgr = AppMgr::new(ServerConfig::default())?;

    mgr.route("/", get(|| async { Payload::from("<p>Hello</p>") }));

    mgr.route(
        "/js",
        get(|| async {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            Payload::from(serde_json::json!({ "x": 1, "y": 2, "now": now }))
        }),
    );

    mgr.route(
        "/about",
        get(|Extension(mgr): Extension<AppMgr>| async move {
            let site = mgr.site_url().unwrap_or_default();
            markup!(
                "<p>This is {}</p>\n\nTry <a href=\"{}\">link</a>\n{}",
                site,
                format!("{site}/q?html=<b>hi</b>"),
                mgr.footer()
            )
        }),
    );

    mgr.route(
        "/q",
        get(|Query(query): Query<HashMap<String, String>>| async move {
            markup!(
                "<p>Query was {}</p>\n\n<p>Query parameter \"html\" was: {}</p>\n",
                format!("{query:?}"),
                query.get("html").cloned()
            )
        }),
    );

    mgr.on_stop("farewell", || async {
        tracing::info!("Goodbye");
        Ok(())
    })?;

    let endpoint = mgr.ready().await?;
    println!("# server started at {}", endpoint.site_url);

    tokio::signal::ctrl_c().await?;
    mgr.stop().await?;
    Ok(())
}
