use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

use appmgr_core::BoxError;

use crate::server::AppMgr;

/// Loads auxiliary data when the server starts.
///
/// `start` spawns the loader and does not wait for it: readiness never
/// depends on the load finishing. Failures are logged.
pub trait DataLoader: Send + Sync + 'static {
    fn load(&self, mgr: AppMgr) -> BoxFuture<'static, Result<(), BoxError>>;
}

impl<F, Fut> DataLoader for F
where
    F: Fn(AppMgr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn load(&self, mgr: AppMgr) -> BoxFuture<'static, Result<(), BoxError>> {
        (self)(mgr).boxed()
    }
}
