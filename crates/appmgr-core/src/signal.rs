use tokio::sync::watch;

/// A broadcast signal that fires at most once.
///
/// Any number of observers may wait on it, before or after it fires. Late
/// observers complete immediately with the stored value. A second `fire`
/// is ignored and reported through the return value, so the first value
/// is the only one ever observed.
pub struct OneShot<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Fulfils the signal. Returns `false` if it had already fired.
    pub fn fire(&self, value: T) -> bool {
        self.tx.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The fired value, without waiting.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Waits until the signal fires and returns a copy of its value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives as long as `self`, so this only fails if
            // the channel is torn down underneath us.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for OneShot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShot").field("value", &*self.tx.borrow()).finish()
    }
}
