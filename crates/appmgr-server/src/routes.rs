use std::sync::{PoisonError, RwLock};

use axum::extract::Request;
use axum::response::Response;
use axum::routing::MethodRouter;
use axum::Router;
use tower::ServiceExt;

/// Application routes, editable while the server is running.
///
/// The listener dispatches every request through a snapshot of this
/// table, so routes registered after the server started are picked up by
/// the next request. Registration follows axum's rules: overlapping or
/// malformed paths panic.
#[derive(Default)]
pub struct RouteTable {
    router: RwLock<Router>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, path: &str, method_router: MethodRouter) {
        tracing::debug!("Registering route {}", path);
        self.update(|router| router.route(path, method_router));
    }

    pub fn merge(&self, other: Router) {
        self.update(|router| router.merge(other));
    }

    /// Current routes. Cloning a `Router` only bumps reference counts.
    pub fn snapshot(&self) -> Router {
        self.router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        match self.snapshot().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    fn update(&self, f: impl FnOnce(Router) -> Router) {
        let mut router = self.router.write().unwrap_or_else(PoisonError::into_inner);
        // Work on a copy so a panicking registration leaves the table intact.
        *router = f(router.clone());
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable").finish_non_exhaustive()
    }
}
