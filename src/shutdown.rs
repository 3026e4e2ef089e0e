use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Shared {
    requested: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

/// Shared flag telling the worker loop to exit.
///
/// The control handler sets it on STOP or SHUTDOWN; the worker polls it, either with
/// [`ShutdownSignal::is_set`] or by sleeping in [`ShutdownSignal::wait_timeout`], which returns
/// early once the flag is raised. Clones observe the same flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    shared: Arc<Shared>,
}

impl ShutdownSignal {
    /// A lowered signal.
    pub fn new() -> Self {
        ShutdownSignal {
            shared: Arc::new(Shared {
                requested: AtomicBool::new(false),
                wake_lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_set(&self) -> bool {
        self.shared.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown. Returns `true` if this call raised the flag.
    pub fn set(&self) -> bool {
        let _wake_lock = self.shared.wake_lock.lock();
        let was_set = self.shared.requested.swap(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        !was_set
    }

    /// Sleep for up to `timeout`, waking early if shutdown is requested.
    /// Returns whether shutdown has been requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut wake_lock = self.shared.wake_lock.lock();
        if !self.is_set() {
            let _ = self
                .shared
                .wake
                .wait_while_for(&mut wake_lock, |_| !self.is_set(), timeout);
        }
        self.is_set()
    }

    /// Block until shutdown is requested.
    pub fn wait(&self) {
        let mut wake_lock = self.shared.wake_lock.lock();
        while !self.is_set() {
            self.shared.wake.wait(&mut wake_lock);
        }
    }

    /// Lower the flag before the service starts.
    pub(crate) fn reset(&self) {
        self.shared.requested.store(false, Ordering::SeqCst);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("requested", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn starts_lowered_and_stays_raised() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_set());
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.is_set());
    }

    #[test]
    fn clones_share_the_flag() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        clone.set();
        assert!(signal.is_set());
    }

    #[test]
    fn wait_timeout_expires_when_not_set() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn waiter_wakes_before_timeout() {
        let signal = ShutdownSignal::new();
        let setter = signal.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set();
        });
        assert!(signal.wait_timeout(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(30));
        handle.join().unwrap();
        signal.wait();
    }
}
