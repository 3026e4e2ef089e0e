//! Console mode.
//!
//! When the process is not started by the operating-system service manager it can still run
//! the same lifecycle under a [`LocalServiceManager`]. Ctrl-C and termination signals are
//! turned into a `Stop` control request, so the application goes through the same
//! `StopPending` / shutdown-signal path as under the real manager. A second signal while the
//! first one is still being handled exits the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::local_manager::LocalServiceManager;
use crate::service::ServiceControl;
use crate::Result;

/// What the console signal handler did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A `Stop` control request was delivered.
    StopRequested,
    /// The service could not take the request, e.g. it is not running yet.
    Ignored,
    /// A stop was already requested; the process should exit now.
    ForceExit,
}

/// Install a process-wide Ctrl-C / termination handler forwarding to `manager`.
///
/// Only one handler can be installed per process.
pub fn forward_console_signals(manager: &LocalServiceManager) -> Result<()> {
    let manager = manager.clone();
    let stop_requested = Arc::new(AtomicBool::new(false));

    ctrlc::set_handler(move || {
        if handle_console_signal(&manager, &stop_requested) == SignalOutcome::ForceExit {
            std::process::exit(1);
        }
    })?;
    Ok(())
}

fn handle_console_signal(manager: &LocalServiceManager, stop_requested: &AtomicBool) -> SignalOutcome {
    if stop_requested.swap(true, Ordering::SeqCst) {
        warn!("Received second signal, forcing immediate exit");
        return SignalOutcome::ForceExit;
    }

    info!("Received console signal, stopping the service");
    match manager.send_control(ServiceControl::Stop) {
        Ok(()) => SignalOutcome::StopRequested,
        Err(e) => {
            warn!("Stop request was not delivered: {}", e);
            stop_requested.store(false, Ordering::SeqCst);
            SignalOutcome::Ignored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_before_registration_is_ignored() {
        let manager = LocalServiceManager::new();
        let stop_requested = AtomicBool::new(false);
        assert_eq!(
            handle_console_signal(&manager, &stop_requested),
            SignalOutcome::Ignored
        );
        // Not counted, so the next signal tries again instead of exiting.
        assert!(!stop_requested.load(Ordering::SeqCst));
    }

    #[test]
    fn second_signal_forces_exit() {
        let manager = LocalServiceManager::new();
        let stop_requested = AtomicBool::new(true);
        assert_eq!(
            handle_console_signal(&manager, &stop_requested),
            SignalOutcome::ForceExit
        );
    }
}
