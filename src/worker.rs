//! Background execution context running the application entry point.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{Error, Result};

/// Returns an identifier of the calling thread, unique within the process and never zero.
#[cfg(windows)]
pub fn current_context_id() -> u64 {
    u64::from(unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() })
}

/// Returns an identifier of the calling thread, unique within the process and never zero.
#[cfg(not(windows))]
pub fn current_context_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static CONTEXT_ID: u64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }
    CONTEXT_ID.with(|id| *id)
}

/// Waitable notification that a worker is gone, either because its entry point returned
/// (or panicked) or because it was terminated.
#[derive(Clone)]
pub struct ExitWatch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ExitWatch {
    fn new() -> Self {
        ExitWatch {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    fn notify(&self) {
        let (exited, condvar) = &*self.inner;
        *exited.lock() = true;
        condvar.notify_all();
    }

    /// Whether the worker has exited or was terminated.
    pub fn has_exited(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until the worker is gone.
    pub fn wait(&self) {
        let (exited, condvar) = &*self.inner;
        let mut exited = exited.lock();
        while !*exited {
            condvar.wait(&mut exited);
        }
    }

    /// Block until the worker is gone or `timeout` elapses. Returns whether it is gone.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (exited, condvar) = &*self.inner;
        let mut exited = exited.lock();
        if !*exited {
            let _ = condvar.wait_while_for(&mut exited, |exited| !*exited, timeout);
        }
        *exited
    }
}

impl fmt::Debug for ExitWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitWatch")
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Notifies the exit watch when the worker thread unwinds or returns.
struct ExitNotifier(ExitWatch);

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        self.0.notify();
    }
}

/// Handle to a thread running an application entry point.
pub struct WorkerHandle {
    name: String,
    context_id: u64,
    thread: JoinHandle<()>,
    exit_watch: ExitWatch,
}

impl WorkerHandle {
    /// Start `entry_point(arguments)` on a new thread named `name`.
    ///
    /// Fails with [`Error::WorkerLaunch`] when the system cannot create the thread.
    pub fn launch<F>(name: impl Into<String>, entry_point: F, arguments: Vec<OsString>) -> Result<Self>
    where
        F: FnOnce(Vec<OsString>) + Send + 'static,
    {
        let name = name.into();
        let exit_watch = ExitWatch::new();
        let notifier = ExitNotifier(exit_watch.clone());
        let (id_tx, id_rx) = std::sync::mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _notifier = notifier;
                let _ = id_tx.send(current_context_id());
                entry_point(arguments);
            })
            .map_err(Error::WorkerLaunch)?;

        let context_id = id_rx.recv().map_err(|_| {
            Error::WorkerLaunch(io::Error::new(
                io::ErrorKind::Other,
                "worker exited before reporting its context id",
            ))
        })?;
        log::debug!("Launched worker {} on context {}", name, context_id);

        Ok(WorkerHandle {
            name,
            context_id,
            thread,
            exit_watch,
        })
    }

    /// Thread name given at launch.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context id of the worker thread, as seen by [`current_context_id`] on that thread.
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Whether the worker thread has finished running.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Watch released when the worker exits or is terminated.
    pub fn exit_watch(&self) -> ExitWatch {
        self.exit_watch.clone()
    }

    /// Wait for the entry point to return.
    pub fn join(self) -> Result<()> {
        self.thread.join().map_err(|_| Error::WorkerPanicked)
    }

    /// Abruptly end the worker.
    ///
    /// No destructors or cleanup code run on the worker. Use the shutdown signal to stop a
    /// worker cooperatively and keep this for emergencies.
    ///
    /// Windows terminates the thread. Other platforms cannot kill a single thread safely, so
    /// the thread is detached and abandoned until the process exits.
    pub fn terminate(self) -> Result<()> {
        if self.thread.is_finished() {
            return self.join();
        }
        log::warn!("Terminating worker {} on context {}", self.name, self.context_id);
        let exit_watch = self.exit_watch.clone();
        self.terminate_thread()?;
        exit_watch.notify();
        Ok(())
    }

    #[cfg(windows)]
    fn terminate_thread(self) -> Result<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::System::Threading::TerminateThread;

        let raw_handle = self.thread.as_raw_handle();
        if unsafe { TerminateThread(raw_handle as _, 1) } == 0 {
            return Err(Error::WorkerTerminate(io::Error::last_os_error()));
        }
        // Dropping the join handle closes the thread handle.
        drop(self.thread);
        Ok(())
    }

    #[cfg(not(windows))]
    fn terminate_thread(self) -> Result<()> {
        drop(self.thread);
        Ok(())
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("context_id", &self.context_id)
            .field("finished", &self.thread.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    #[test]
    fn context_ids_are_distinct_per_thread() {
        let here = current_context_id();
        assert_ne!(here, 0);
        assert_eq!(here, current_context_id());
        let there = thread::spawn(current_context_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn launch_passes_arguments_and_joins() {
        let (tx, rx) = mpsc::channel();
        let worker = WorkerHandle::launch(
            "args-worker",
            move |arguments| {
                tx.send((arguments, current_context_id())).unwrap();
            },
            vec![OsString::from("app"), OsString::from("--flag")],
        )
        .unwrap();
        let context_id = worker.context_id();
        worker.join().unwrap();

        let (arguments, seen) = rx.recv().unwrap();
        assert_eq!(arguments, vec![OsString::from("app"), OsString::from("--flag")]);
        assert_eq!(seen, context_id);
    }

    #[test]
    fn exit_watch_fires_when_entry_point_returns() {
        let worker = WorkerHandle::launch("short-worker", |_| {}, Vec::new()).unwrap();
        let watch = worker.exit_watch();
        assert!(watch.wait_timeout(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn panicking_entry_point_is_reported() {
        let worker = WorkerHandle::launch("panic-worker", |_| panic!("boom"), Vec::new()).unwrap();
        worker.exit_watch().wait();
        assert!(matches!(worker.join(), Err(Error::WorkerPanicked)));
    }

    #[test]
    fn terminate_releases_exit_watch() {
        let release = Arc::new(AtomicBool::new(false));
        let worker_release = Arc::clone(&release);
        let worker = WorkerHandle::launch(
            "stuck-worker",
            move |_| {
                while !worker_release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(10));
                }
            },
            Vec::new(),
        )
        .unwrap();
        let watch = worker.exit_watch();
        assert!(!watch.has_exited());

        worker.terminate().unwrap();
        assert!(watch.has_exited());
        release.store(true, Ordering::SeqCst);
    }
}
