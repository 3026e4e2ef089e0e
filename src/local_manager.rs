//! In-process stand-in for the operating-system service manager.
//!
//! [`LocalServiceManager`] follows the protocol of the Windows Service Control Manager closely
//! enough to drive a [`ServiceController`](crate::controller::ServiceController) anywhere:
//!
//! * [`start_dispatcher`](ServiceManager::start_dispatcher) blocks the caller and runs service
//!   main on a thread the manager owns;
//! * control requests are delivered one at a time, each on a fresh thread, and only when the
//!   last reported status accepts them (`Interrogate` and unknown codes are always delivered);
//! * status reports must come through the handle returned at registration.
//!
//! Every report is recorded so callers can inspect the sequence the service produced.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::service::{ServiceControl, ServiceControlAccept, ServiceState, ServiceStatus};
use crate::service_manager::{ControlHandlerFn, ServiceMainFn, ServiceManager};
use crate::status_handle::StatusHandle;
use crate::{Error, Result};

#[derive(Default)]
struct Registry {
    service_name: Option<String>,
    handler: Option<ControlHandlerFn>,
    handle: Option<StatusHandle>,
    reports: Vec<ServiceStatus>,
    dispatcher_starts: usize,
    next_handle: isize,
}

impl Registry {
    fn is_in_state(&self, state: ServiceState) -> bool {
        self.reports
            .last()
            .map_or(false, |status| status.current_state == state)
    }
}

struct Inner {
    registry: Mutex<Registry>,
    status_changed: Condvar,
    control_lane: Mutex<()>,
    reject_dispatcher: AtomicBool,
    reject_control_handler: AtomicBool,
    reject_status_reports: AtomicBool,
}

/// In-process service manager. Clones share the same registry.
#[derive(Clone)]
pub struct LocalServiceManager {
    inner: Arc<Inner>,
}

impl LocalServiceManager {
    /// A manager with no service started and nothing recorded.
    pub fn new() -> Self {
        LocalServiceManager {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                status_changed: Condvar::new(),
                control_lane: Mutex::new(()),
                reject_dispatcher: AtomicBool::new(false),
                reject_control_handler: AtomicBool::new(false),
                reject_status_reports: AtomicBool::new(false),
            }),
        }
    }

    /// Refuse dispatcher connections, as when the process was not started by a manager.
    pub fn reject_dispatcher(&self, reject: bool) {
        self.inner.reject_dispatcher.store(reject, Ordering::SeqCst);
    }

    /// Refuse control handler registrations.
    pub fn reject_control_handler(&self, reject: bool) {
        self.inner
            .reject_control_handler
            .store(reject, Ordering::SeqCst);
    }

    /// Refuse status reports.
    pub fn reject_status_reports(&self, reject: bool) {
        self.inner.reject_status_reports.store(reject, Ordering::SeqCst);
    }

    /// Deliver a control request to the registered handler and wait until it was handled.
    pub fn send_control(&self, control: ServiceControl) -> Result<()> {
        self.send_raw_control(control.to_raw())
    }

    /// Deliver a raw control code to the registered handler and wait until it was handled.
    pub fn send_raw_control(&self, code: u32) -> Result<()> {
        let _lane = self.inner.control_lane.lock();

        let handler = {
            let registry = self.inner.registry.lock();
            let handler = registry.handler.ok_or(Error::NotRegistered)?;
            let accepted = registry
                .reports
                .last()
                .map(|status| status.controls_accepted)
                .unwrap_or_else(ServiceControlAccept::empty);
            if !is_deliverable(code, accepted) {
                return Err(Error::ControlNotAccepted(code));
            }
            handler
        };

        log::debug!("Delivering control code {}", code);
        thread::Builder::new()
            .name("service-control".to_string())
            .spawn(move || handler(code))
            .map_err(Error::WorkerLaunch)?
            .join()
            .map_err(|_| Error::WorkerPanicked)
    }

    /// All status reports received so far, oldest first.
    pub fn reports(&self) -> Vec<ServiceStatus> {
        self.inner.registry.lock().reports.clone()
    }

    /// The most recent status report, if any.
    pub fn last_status(&self) -> Option<ServiceStatus> {
        self.inner.registry.lock().reports.last().cloned()
    }

    /// How many times a dispatcher connection was accepted.
    pub fn dispatcher_starts(&self) -> usize {
        self.inner.registry.lock().dispatcher_starts
    }

    /// Whether a control handler is currently registered.
    pub fn is_handler_registered(&self) -> bool {
        self.inner.registry.lock().handler.is_some()
    }

    /// Wait until the most recent report carries `state`. Returns whether it did in time.
    pub fn wait_for_state(&self, state: ServiceState, timeout: Duration) -> bool {
        let mut registry = self.inner.registry.lock();
        if !registry.is_in_state(state) {
            let _ = self.inner.status_changed.wait_while_for(
                &mut registry,
                |registry| !registry.is_in_state(state),
                timeout,
            );
        }
        registry.is_in_state(state)
    }
}

impl Default for LocalServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("LocalServiceManager")
            .field("service_name", &registry.service_name)
            .field("handle", &registry.handle)
            .field("reports", &registry.reports.len())
            .finish()
    }
}

impl ServiceManager for LocalServiceManager {
    fn start_dispatcher(
        &self,
        service_name: &str,
        arguments: Vec<OsString>,
        service_main: ServiceMainFn,
    ) -> Result<()> {
        if self.inner.reject_dispatcher.load(Ordering::SeqCst) {
            return Err(Error::DispatcherRegistration(io::Error::new(
                io::ErrorKind::NotConnected,
                "the service process could not connect to the service manager",
            )));
        }
        {
            let mut registry = self.inner.registry.lock();
            registry.service_name = Some(service_name.to_string());
            registry.dispatcher_starts += 1;
        }
        log::debug!("Dispatching service main for {}", service_name);

        thread::Builder::new()
            .name(format!("{}-main", service_name))
            .spawn(move || service_main(arguments))
            .map_err(Error::DispatcherRegistration)?
            .join()
            .map_err(|_| Error::WorkerPanicked)
    }

    fn register_control_handler(
        &self,
        service_name: &str,
        handler: ControlHandlerFn,
    ) -> Result<StatusHandle> {
        if self.inner.reject_control_handler.load(Ordering::SeqCst) {
            return Err(Error::HandlerRegistration(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "control handler registration refused",
            )));
        }

        let mut registry = self.inner.registry.lock();
        if registry.service_name.as_deref() != Some(service_name) {
            return Err(Error::HandlerRegistration(io::Error::new(
                io::ErrorKind::NotFound,
                format!("service {} was not started by this manager", service_name),
            )));
        }

        registry.next_handle += 1;
        let handle = StatusHandle::from_raw(registry.next_handle).ok_or_else(|| {
            Error::HandlerRegistration(io::Error::new(
                io::ErrorKind::Other,
                "status handle space exhausted",
            ))
        })?;
        registry.handler = Some(handler);
        registry.handle = Some(handle);
        Ok(handle)
    }

    fn set_service_status(&self, handle: &StatusHandle, status: &ServiceStatus) -> Result<()> {
        if self.inner.reject_status_reports.load(Ordering::SeqCst) {
            return Err(Error::StatusReport(io::Error::new(
                io::ErrorKind::Other,
                "status report refused",
            )));
        }

        let mut registry = self.inner.registry.lock();
        if registry.handle != Some(*handle) {
            return Err(Error::StatusReport(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unknown status handle",
            )));
        }
        registry.reports.push(status.clone());
        self.inner.status_changed.notify_all();
        Ok(())
    }
}

/// Whether a control code reaches the handler given the currently accepted controls.
fn is_deliverable(code: u32, accepted: ServiceControlAccept) -> bool {
    match ServiceControl::from_raw(code) {
        Ok(ServiceControl::Stop) => accepted.contains(ServiceControlAccept::STOP),
        Ok(ServiceControl::Pause) | Ok(ServiceControl::Continue) => {
            accepted.contains(ServiceControlAccept::PAUSE_CONTINUE)
        }
        Ok(ServiceControl::Shutdown) => accepted.contains(ServiceControlAccept::SHUTDOWN),
        Ok(ServiceControl::Interrogate) | Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceExitCode;
    use std::sync::atomic::AtomicU32;

    fn running(accepted: ServiceControlAccept) -> ServiceStatus {
        ServiceStatus {
            current_state: ServiceState::Running,
            controls_accepted: accepted,
            exit_code: ServiceExitCode::NO_ERROR,
            checkpoint: 0,
            wait_hint: Duration::from_secs(3),
        }
    }

    static LAST_CODE: AtomicU32 = AtomicU32::new(0);

    fn record_code(code: u32) {
        LAST_CODE.store(code, Ordering::SeqCst);
    }

    fn noop_main(_arguments: Vec<OsString>) {}

    #[test]
    fn rejected_dispatcher_has_no_side_effects() {
        let manager = LocalServiceManager::new();
        manager.reject_dispatcher(true);
        let result = manager.start_dispatcher("svc", Vec::new(), noop_main);
        assert!(matches!(result, Err(Error::DispatcherRegistration(_))));
        assert_eq!(manager.dispatcher_starts(), 0);
    }

    #[test]
    fn registration_requires_a_started_service() {
        let manager = LocalServiceManager::new();
        let result = manager.register_control_handler("svc", record_code);
        assert!(matches!(result, Err(Error::HandlerRegistration(_))));

        manager.start_dispatcher("svc", Vec::new(), noop_main).unwrap();
        let handle = manager.register_control_handler("svc", record_code).unwrap();
        assert_ne!(handle.raw_handle(), 0);
        assert!(manager.is_handler_registered());
    }

    #[test]
    fn reports_need_the_registered_handle() {
        let manager = LocalServiceManager::new();
        manager.start_dispatcher("svc", Vec::new(), noop_main).unwrap();
        let handle = manager.register_control_handler("svc", record_code).unwrap();

        let stale = StatusHandle::from_raw(handle.raw_handle() + 100).unwrap();
        let status = running(ServiceControlAccept::STOP);
        assert!(matches!(
            manager.set_service_status(&stale, &status),
            Err(Error::StatusReport(_))
        ));
        manager.set_service_status(&handle, &status).unwrap();
        assert_eq!(manager.reports(), vec![status]);
        assert!(manager.wait_for_state(ServiceState::Running, Duration::ZERO));
    }

    #[test]
    fn controls_are_filtered_by_accepted_set() {
        let manager = LocalServiceManager::new();
        assert!(matches!(
            manager.send_control(ServiceControl::Stop),
            Err(Error::NotRegistered)
        ));

        manager.start_dispatcher("svc", Vec::new(), noop_main).unwrap();
        let handle = manager.register_control_handler("svc", record_code).unwrap();
        manager
            .set_service_status(&handle, &running(ServiceControlAccept::STOP))
            .unwrap();

        assert!(matches!(
            manager.send_control(ServiceControl::Pause),
            Err(Error::ControlNotAccepted(2))
        ));
        manager.send_control(ServiceControl::Interrogate).unwrap();
        assert_eq!(LAST_CODE.load(Ordering::SeqCst), 4);
        manager.send_control(ServiceControl::Stop).unwrap();
        assert_eq!(LAST_CODE.load(Ordering::SeqCst), 1);
        manager.send_raw_control(200).unwrap();
        assert_eq!(LAST_CODE.load(Ordering::SeqCst), 200);
    }
}
