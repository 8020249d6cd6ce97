use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{AppMgrError, BoxError, Result};

struct StopHook {
    name: String,
    /// The action does not run until this is first polled. A hook
    /// interrupted mid-run keeps its progress here.
    run: BoxFuture<'static, Result<(), BoxError>>,
}

enum HookState {
    /// Accepting registrations.
    Open(VecDeque<StopHook>),
    /// Shutdown has begun; the queue only shrinks from here.
    Draining(VecDeque<StopHook>),
}

/// Ordered teardown actions run once, strictly in registration order.
///
/// ## Ordering
/// Hooks never overlap: each one is awaited to completion before the next
/// is invoked, so a later hook may rely on resources released by an
/// earlier one (close a database, then delete its directory).
///
/// ## Failure
/// The first failing hook aborts the drain. Hooks queued behind it are
/// kept, and the next call to [`StopHooks::drain`] resumes with them.
///
/// ## Cancellation
/// Dropping a drain while a hook is running puts that hook back at the
/// front of the queue, partially run. The next drain finishes it before
/// moving on.
pub struct StopHooks {
    state: Mutex<HookState>,
}

impl StopHooks {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HookState::Open(VecDeque::new())),
        }
    }

    /// Appends a hook. Rejected once shutdown has begun.
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let name = name.into();
        match &mut *self.lock() {
            HookState::Open(queue) => {
                tracing::debug!("Registered stop hook `{}` (position {})", name, queue.len());
                queue.push_back(StopHook {
                    name,
                    run: async move { action().await }.boxed(),
                });
                Ok(())
            }
            HookState::Draining(_) => {
                tracing::warn!("Rejected stop hook `{}`: shutdown already in progress", name);
                Err(AppMgrError::HookRejected(name))
            }
        }
    }

    /// Number of hooks that have not run yet.
    pub fn len(&self) -> usize {
        match &*self.lock() {
            HookState::Open(queue) | HookState::Draining(queue) => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        matches!(&*self.lock(), HookState::Draining(_))
    }

    /// Runs every pending hook in order. Returns how many completed.
    pub async fn drain(&self) -> Result<usize> {
        self.freeze();
        let mut completed = 0;
        while let Some(hook) = self.pop() {
            tracing::debug!("Running stop hook `{}`", hook.name);
            let mut in_flight = InFlight {
                hooks: self,
                hook: Some(hook),
            };
            let Some((name, outcome)) = in_flight.run().await else {
                continue;
            };
            if let Err(source) = outcome {
                tracing::error!("Stop hook `{}` failed: {}", name, source);
                return Err(AppMgrError::hook(name, source));
            }
            completed += 1;
        }
        Ok(completed)
    }

    fn freeze(&self) {
        let mut state = self.lock();
        if let HookState::Open(queue) = &mut *state {
            let queue = std::mem::take(queue);
            *state = HookState::Draining(queue);
        }
    }

    fn pop(&self) -> Option<StopHook> {
        match &mut *self.lock() {
            HookState::Open(queue) | HookState::Draining(queue) => queue.pop_front(),
        }
    }

    fn requeue(&self, hook: StopHook) {
        match &mut *self.lock() {
            HookState::Open(queue) | HookState::Draining(queue) => queue.push_front(hook),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HookState> {
        // Hooks run outside the lock, so a poisoned guard still holds a
        // consistent queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A popped hook that goes back to the queue unless it runs to completion.
struct InFlight<'a> {
    hooks: &'a StopHooks,
    hook: Option<StopHook>,
}

impl InFlight<'_> {
    async fn run(&mut self) -> Option<(String, Result<(), BoxError>)> {
        let hook = self.hook.as_mut()?;
        let outcome = (&mut hook.run).await;
        self.hook.take().map(|hook| (hook.name, outcome))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            tracing::warn!("Stop hook `{}` interrupted; it will resume on the next stop", hook.name);
            self.hooks.requeue(hook);
        }
    }
}

impl Default for StopHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHooks")
            .field("pending", &self.len())
            .field("draining", &self.is_draining())
            .finish()
    }
}
