use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    stopped: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

/// Requests cancellation of every loop holding a matching `StopToken`.
#[derive(Clone)]
pub struct StopSource {
    inner: Arc<Inner>,
}

/// Observes a `StopSource`. Long-lived loops poll `is_stop_requested` and
/// register `on_stop` callbacks to interrupt their blocking waits.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<Inner>,
}

impl StopSource {
    pub fn new() -> StopSource {
        StopSource {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn token(&self) -> StopToken {
        StopToken {
            inner: self.inner.clone(),
        }
    }

    /// Flips the stop flag and fires every registered callback exactly
    /// once. Subsequent calls are no-ops.
    pub fn request_stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks = {
            let mut guard = self.inner.callbacks.lock().expect("stop callback lock poisoned");
            std::mem::take(&mut *guard)
        };

        for callback in &callbacks {
            callback();
        }
    }
}

impl StopToken {
    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Registers a callback to run when stop is requested. If stop was
    /// already requested the callback fires immediately on this thread.
    pub fn on_stop<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        if self.is_stop_requested() {
            callback();
            return;
        }

        let mut guard = self.inner.callbacks.lock().expect("stop callback lock poisoned");
        // Re-check under the lock so a racing request_stop cannot strand
        // the callback in the drained list.
        if self.inner.stopped.load(Ordering::SeqCst) {
            drop(guard);
            callback();
            return;
        }
        guard.push(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_flag_propagates() {
        let source = StopSource::new();
        let token = source.token();

        assert!(!token.is_stop_requested());
        source.request_stop();
        assert!(token.is_stop_requested());
    }

    #[test]
    fn test_callback_fires_on_stop() {
        let source = StopSource::new();
        let token = source.token();
        let fired = Arc::new(AtomicUsize::new(0));

        let observed = fired.clone();
        token.on_stop(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        source.request_stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A second request does not re-fire.
        source.request_stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_fires_immediately() {
        let source = StopSource::new();
        let token = source.token();
        source.request_stop();

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        token.on_stop(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
