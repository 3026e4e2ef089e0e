//! The service lifecycle controller.
//!
//! [`ServiceController`] owns the service descriptor and mediates between three execution
//! contexts:
//!
//! * the driver, blocked in [`ServiceController::start`] while the manager dispatches the
//!   service;
//! * the manager's callbacks: service main, which registers the control handler, reports
//!   `Running` and launches the application, and the control handler, which runs once per
//!   control request;
//! * the worker running the application entry point, which polls the [`ShutdownSignal`].
//!
//! Manager callbacks carry no context, so they resolve the controller through a process-wide
//! slot. Only one controller may be live at a time; [`ServiceController::new`] fails with
//! [`Error::ControllerAlreadyActive`] while another one exists.

use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
};
use crate::service_manager::ServiceManager;
use crate::shutdown::ShutdownSignal;
use crate::status_handle::StatusHandle;
use crate::sync::Lock;
use crate::worker::WorkerHandle;
use crate::{Error, Result};

/// Application entry point run on the worker thread with the service start arguments.
pub type EntryPoint = Box<dyn FnOnce(Vec<OsString>) + Send + 'static>;

/// Service specific exit code reported when the application could not run to completion.
pub const ABNORMAL_EXIT_CODE: u32 = 1;

/// The controller the manager callbacks resolve to.
static ACTIVE: Lock<Option<Arc<Inner>>> = Lock::new(None);

/// Everything [`ServiceController::start`] needs to run the application.
///
/// The shutdown signal and the entry point are mandatory; `start` rejects a launch missing
/// either one before touching any state.
#[derive(Default)]
pub struct ServiceLaunch {
    arguments: Vec<OsString>,
    shutdown: Option<ShutdownSignal>,
    entry_point: Option<EntryPoint>,
}

impl ServiceLaunch {
    /// An empty launch; add a shutdown signal and an entry point before starting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start arguments for managers that do not supply their own.
    pub fn arguments(mut self, arguments: Vec<OsString>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Signal raised when the manager asks the service to stop.
    pub fn shutdown_signal(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Application code run once on the worker thread after `Running` is reported.
    pub fn entry_point<F>(mut self, entry_point: F) -> Self
    where
        F: FnOnce(Vec<OsString>) + Send + 'static,
    {
        self.entry_point = Some(Box::new(entry_point));
        self
    }
}

impl fmt::Debug for ServiceLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLaunch")
            .field("arguments", &self.arguments)
            .field("shutdown", &self.shutdown)
            .field("entry_point", &self.entry_point.is_some())
            .finish()
    }
}

/// Service state as last reported, or about to be reported, to the manager.
#[derive(Debug, Clone)]
struct ServiceDescriptor {
    current_state: ServiceState,
    accepted_controls: ServiceControlAccept,
    default_controls: ServiceControlAccept,
    checkpoint: u32,
    wait_hint: Duration,
    exit_code: ServiceExitCode,
}

impl ServiceDescriptor {
    fn new(default_controls: ServiceControlAccept, wait_hint: Duration) -> Self {
        ServiceDescriptor {
            current_state: ServiceState::Stopped,
            accepted_controls: default_controls,
            default_controls,
            checkpoint: 0,
            wait_hint,
            exit_code: ServiceExitCode::NO_ERROR,
        }
    }

    /// Record a transition and return the status record describing it.
    fn transition(
        &mut self,
        state: ServiceState,
        wait_hint: Duration,
        exit_code: ServiceExitCode,
    ) -> ServiceStatus {
        self.accepted_controls = if state == ServiceState::StartPending {
            ServiceControlAccept::empty()
        } else {
            self.default_controls
        };
        self.current_state = state;
        self.wait_hint = wait_hint;
        self.exit_code = exit_code;
        if state.is_settled() {
            self.checkpoint = 0;
        } else {
            self.checkpoint = self.checkpoint.wrapping_add(1);
        }
        self.snapshot()
    }

    fn snapshot(&self) -> ServiceStatus {
        ServiceStatus {
            current_state: self.current_state,
            controls_accepted: self.accepted_controls,
            exit_code: self.exit_code,
            checkpoint: self.checkpoint,
            wait_hint: self.wait_hint,
        }
    }
}

/// State shared between the driver, the manager callbacks and status reporters.
struct Registration {
    descriptor: ServiceDescriptor,
    status_handle: Option<StatusHandle>,
    shutdown: Option<ShutdownSignal>,
}

struct Inner {
    config: ServiceConfig,
    manager: Arc<dyn ServiceManager>,
    registration: Lock<Registration>,
    entry_point: Lock<Option<EntryPoint>>,
    worker: Lock<Option<WorkerHandle>>,
    startup_failure: Lock<Option<Error>>,
}

impl Inner {
    fn name(&self) -> &str {
        &self.config.service_name
    }

    fn report_status(
        &self,
        state: ServiceState,
        wait_hint: Duration,
        exit_code: ServiceExitCode,
    ) -> Result<()> {
        let mut registration = self.registration.acquire()?;
        self.submit(&mut registration, state, wait_hint, exit_code)
    }

    /// Record and submit a transition. Without a status handle nothing is recorded.
    fn submit(
        &self,
        registration: &mut Registration,
        state: ServiceState,
        wait_hint: Duration,
        exit_code: ServiceExitCode,
    ) -> Result<()> {
        let handle = registration.status_handle.ok_or(Error::NotRegistered)?;
        let status = registration
            .descriptor
            .transition(state, wait_hint, exit_code);
        debug!(
            "Reporting {:?} for {} (checkpoint {}, wait hint {:?})",
            status.current_state,
            self.name(),
            status.checkpoint,
            status.wait_hint
        );
        self.manager.set_service_status(&handle, &status)
    }

    fn status(&self) -> Result<ServiceStatus> {
        Ok(self.registration.acquire()?.descriptor.snapshot())
    }

    fn handle_raw_control(&self, code: u32) -> Result<()> {
        let control = ServiceControl::from_raw(code)?;
        self.handle_control(control)
    }

    fn handle_control(&self, control: ServiceControl) -> Result<()> {
        let mut registration = self.registration.acquire()?;
        debug!("Received {:?} for {}", control, self.name());

        match control {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                registration.descriptor.current_state = ServiceState::StopPending;
                let reported = self.submit(
                    &mut registration,
                    ServiceState::StopPending,
                    self.config.wait_hint(),
                    ServiceExitCode::NO_ERROR,
                );
                // The worker must stop even if the manager did not take the report.
                if let Some(shutdown) = &registration.shutdown {
                    if shutdown.set() {
                        info!("Shutdown of {} requested by {:?}", self.name(), control);
                    }
                }
                reported
            }
            ServiceControl::Pause => {
                registration.descriptor.current_state = ServiceState::PausePending;
                Ok(())
            }
            ServiceControl::Continue => {
                registration.descriptor.current_state = ServiceState::ContinuePending;
                Ok(())
            }
            ServiceControl::Interrogate => {
                let ServiceDescriptor {
                    current_state,
                    wait_hint,
                    exit_code,
                    ..
                } = registration.descriptor;
                self.submit(&mut registration, current_state, wait_hint, exit_code)
            }
        }
    }

    fn service_main(&self, arguments: Vec<OsString>) -> Result<()> {
        let handle = self
            .manager
            .register_control_handler(self.name(), dispatch_control)?;
        {
            let mut registration = self.registration.acquire()?;
            registration.status_handle = Some(handle);
            self.submit(
                &mut registration,
                ServiceState::Running,
                self.config.wait_hint(),
                ServiceExitCode::NO_ERROR,
            )?;
        }
        info!("Service {} is running", self.name());

        let entry_point = self
            .entry_point
            .acquire()?
            .take()
            .ok_or(Error::MissingEntryPoint)?;
        let worker = match WorkerHandle::launch(format!("{}-worker", self.name()), entry_point, arguments) {
            Ok(worker) => worker,
            Err(e) => {
                error!("Failed to launch the worker of {}: {}", self.name(), e);
                self.report_abnormal_stop();
                return Err(e);
            }
        };

        let exit_watch = worker.exit_watch();
        *self.worker.acquire()? = Some(worker);
        exit_watch.wait();

        // Gone already if the worker was terminated.
        let worker = self.worker.acquire()?.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.join() {
                error!("Worker of {} ended abnormally: {}", self.name(), e);
                self.report_abnormal_stop();
                return Err(e);
            }
        }

        let state = self.status()?.current_state;
        if state != ServiceState::Stopped {
            debug!("Worker of {} exited while the service is {:?}", self.name(), state);
        }
        Ok(())
    }

    /// Report `Stopped` with a service specific error once the application is gone.
    fn report_abnormal_stop(&self) {
        if let Err(e) = self.report_status(
            ServiceState::Stopped,
            self.config.wait_hint(),
            ServiceExitCode::from_application_code(ABNORMAL_EXIT_CODE),
        ) {
            warn!("Failed to report {} as stopped: {}", self.name(), e);
        }
    }

    /// Undo `start` after the dispatcher could not be reached.
    fn roll_back_start(&self) -> Result<()> {
        self.entry_point.acquire()?.take();
        let mut registration = self.registration.acquire()?;
        let descriptor = &mut registration.descriptor;
        descriptor.current_state = ServiceState::Stopped;
        descriptor.accepted_controls = descriptor.default_controls;
        Ok(())
    }
}

fn active() -> Option<Arc<Inner>> {
    match ACTIVE.acquire() {
        Ok(active) => active.clone(),
        Err(e) => {
            error!("Failed to resolve the active service controller: {}", e);
            None
        }
    }
}

/// Service main callback handed to the manager.
fn dispatch_service_main(arguments: Vec<OsString>) {
    let Some(inner) = active() else {
        error!("Service main invoked without an active service controller");
        return;
    };
    if let Err(e) = inner.service_main(arguments) {
        error!("Service {} did not start: {}", inner.name(), e);
        match inner.startup_failure.acquire() {
            Ok(mut failure) => *failure = Some(e),
            Err(e) => error!("Failed to record the startup failure: {}", e),
        }
    }
}

/// Control handler callback handed to the manager.
fn dispatch_control(code: u32) {
    match active() {
        Some(inner) => match inner.handle_raw_control(code) {
            Ok(()) => {}
            Err(Error::ParseValue(_)) => {
                debug!("Ignoring unknown control code {} for {}", code, inner.name())
            }
            Err(e) => warn!("Handling control code {} for {} failed: {}", code, inner.name(), e),
        },
        None => warn!("Control code {} received without an active service controller", code),
    }
}

/// Runs an application as a managed service.
pub struct ServiceController {
    inner: Arc<Inner>,
}

impl ServiceController {
    /// Create the process-wide service controller.
    pub fn new(config: ServiceConfig, manager: Arc<dyn ServiceManager>) -> Result<Self> {
        config.validate()?;

        let mut active = ACTIVE.acquire()?;
        if active.is_some() {
            return Err(Error::ControllerAlreadyActive);
        }

        let descriptor = ServiceDescriptor::new(config.accepted_controls, config.wait_hint());
        let inner = Arc::new(Inner {
            config,
            manager,
            registration: Lock::new(Registration {
                descriptor,
                status_handle: None,
                shutdown: None,
            }),
            entry_point: Lock::new(None),
            worker: Lock::new(None),
            startup_failure: Lock::new(None),
        });
        *active = Some(Arc::clone(&inner));
        Ok(ServiceController { inner })
    }

    /// Name the service is registered under.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Validated configuration the controller was created with.
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Run the application as a service.
    ///
    /// Lowers `shutdown`, stores the entry point and connects to the manager, blocking until
    /// the manager is done with the service. The manager then calls back into service main,
    /// which registers the control handler, reports `Running` and only then runs the entry
    /// point once on a worker thread.
    ///
    /// Fails without side effects if the launch lacks a shutdown signal or an entry point.
    /// Fails with [`Error::DispatcherRegistration`] when the manager cannot be reached, for
    /// instance when the process was not started by it, and with the service main error when
    /// the service could not be brought to `Running`.
    pub fn start(&self, launch: ServiceLaunch) -> Result<()> {
        let ServiceLaunch {
            arguments,
            shutdown,
            entry_point,
        } = launch;
        let shutdown = shutdown.ok_or(Error::MissingShutdownSignal)?;
        let entry_point = entry_point.ok_or(Error::MissingEntryPoint)?;

        shutdown.reset();
        {
            let mut registration = self.inner.registration.acquire()?;
            registration.shutdown = Some(shutdown);
            registration.descriptor.current_state = ServiceState::StartPending;
            registration.descriptor.accepted_controls = ServiceControlAccept::empty();
        }
        *self.inner.entry_point.acquire()? = Some(entry_point);
        *self.inner.startup_failure.acquire()? = None;

        info!("Starting service {}", self.name());
        if let Err(e) =
            self.inner
                .manager
                .start_dispatcher(self.name(), arguments, dispatch_service_main)
        {
            error!("Service {} could not connect to the service manager: {}", self.name(), e);
            self.inner.roll_back_start()?;
            return Err(e);
        }

        match self.inner.startup_failure.acquire()?.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Report `state` with the configured wait hint and no error.
    pub fn report_status(&self, state: ServiceState) -> Result<()> {
        self.reporter().report_status(state)
    }

    /// Report `state` with an explicit wait hint and application exit code.
    ///
    /// A nonzero `exit_code` is reported as a service specific error.
    pub fn report_status_with(
        &self,
        state: ServiceState,
        wait_hint: Duration,
        exit_code: u32,
    ) -> Result<()> {
        self.reporter()
            .report_status_with(state, wait_hint, exit_code)
    }

    /// Report the service as stopped.
    pub fn stop(&self) -> Result<()> {
        self.reporter().stop()
    }

    /// Report the service as stopped because of an application error.
    pub fn stop_with_error(&self, exit_code: u32) -> Result<()> {
        self.reporter().stop_with_error(exit_code)
    }

    /// Apply a control request exactly as the control handler does.
    pub fn handle_control(&self, control: ServiceControl) -> Result<()> {
        self.inner.handle_control(control)
    }

    /// Apply a raw control code. Unknown codes change nothing and fail with
    /// [`Error::ParseValue`].
    pub fn handle_raw_control(&self, code: u32) -> Result<()> {
        self.inner.handle_raw_control(code)
    }

    /// Snapshot of the service descriptor.
    pub fn status(&self) -> Result<ServiceStatus> {
        self.inner.status()
    }

    /// Reporter usable from the worker thread.
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Emergency stop: abruptly end the worker running the entry point.
    ///
    /// This bypasses every cleanup path of the application. The orderly way to stop is the
    /// shutdown signal, which the worker loop polls. Returns whether a worker was running.
    pub fn terminate_worker(&self) -> Result<bool> {
        let worker = self.inner.worker.acquire()?.take();
        match worker {
            Some(worker) => {
                warn!("Emergency stop of the worker of {}", self.name());
                worker.terminate()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for ServiceController {
    fn drop(&mut self) {
        match ACTIVE.acquire() {
            Ok(mut active) => {
                if active
                    .as_ref()
                    .map_or(false, |inner| Arc::ptr_eq(inner, &self.inner))
                {
                    *active = None;
                }
            }
            Err(e) => error!("Failed to release the active service controller: {}", e),
        }
    }
}

impl fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceController")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Cloneable handle for reporting status from any thread, typically the worker once its loop
/// has ended.
#[derive(Clone)]
pub struct StatusReporter {
    inner: Arc<Inner>,
}

impl StatusReporter {
    /// Report `state` with the configured wait hint and no error.
    pub fn report_status(&self, state: ServiceState) -> Result<()> {
        self.inner
            .report_status(state, self.inner.config.wait_hint(), ServiceExitCode::NO_ERROR)
    }

    /// Report `state` with an explicit wait hint and application exit code.
    pub fn report_status_with(
        &self,
        state: ServiceState,
        wait_hint: Duration,
        exit_code: u32,
    ) -> Result<()> {
        self.inner.report_status(
            state,
            wait_hint,
            ServiceExitCode::from_application_code(exit_code),
        )
    }

    /// Report the service as stopped.
    pub fn stop(&self) -> Result<()> {
        info!("Service {} stopped", self.inner.name());
        self.report_status(ServiceState::Stopped)
    }

    /// Report the service as stopped with a service specific `exit_code`.
    pub fn stop_with_error(&self, exit_code: u32) -> Result<()> {
        warn!("Service {} stopped with error {}", self.inner.name(), exit_code);
        self.report_status_with(ServiceState::Stopped, self.inner.config.wait_hint(), exit_code)
    }

    /// Snapshot of the service descriptor.
    pub fn status(&self) -> Result<ServiceStatus> {
        self.inner.status()
    }
}

impl fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReporter")
            .field("name", &self.inner.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_manager::LocalServiceManager;
    use crate::service::ParseRawError;
    use parking_lot::Mutex;

    /// Controllers are process-wide; tests creating them take turns.
    static SERIAL: Mutex<()> = parking_lot::const_mutex(());

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceControlAccept::STOP, Duration::from_millis(3000))
    }

    #[test]
    fn checkpoint_counts_pending_reports_from_one() {
        let mut descriptor = descriptor();
        assert_eq!(
            descriptor
                .transition(ServiceState::Running, Duration::from_secs(3), ServiceExitCode::NO_ERROR)
                .checkpoint,
            0
        );
        let checkpoints: Vec<u32> = (0..3)
            .map(|_| {
                descriptor
                    .transition(
                        ServiceState::StopPending,
                        Duration::from_secs(3),
                        ServiceExitCode::NO_ERROR,
                    )
                    .checkpoint
            })
            .collect();
        assert_eq!(checkpoints, vec![1, 2, 3]);

        let stopped = descriptor.transition(
            ServiceState::Stopped,
            Duration::from_secs(3),
            ServiceExitCode::NO_ERROR,
        );
        assert_eq!(stopped.checkpoint, 0);
    }

    #[test]
    fn controls_are_withheld_only_while_starting() {
        let mut descriptor = descriptor();
        for state in [
            ServiceState::StartPending,
            ServiceState::Running,
            ServiceState::PausePending,
            ServiceState::StopPending,
            ServiceState::Stopped,
        ] {
            let status = descriptor.transition(state, Duration::ZERO, ServiceExitCode::NO_ERROR);
            assert_eq!(
                status.controls_accepted.is_empty(),
                state == ServiceState::StartPending,
                "{:?}",
                state
            );
        }
    }

    #[test]
    fn repeated_reports_differ_only_in_checkpoint() {
        let mut descriptor = descriptor();
        let hint = Duration::from_millis(1500);
        let first = descriptor.transition(ServiceState::StopPending, hint, ServiceExitCode::NO_ERROR);
        let second = descriptor.transition(ServiceState::StopPending, hint, ServiceExitCode::NO_ERROR);
        assert_eq!(first.controls_accepted, second.controls_accepted);
        assert_eq!(first.wait_hint, second.wait_hint);
        assert_eq!(second.checkpoint, first.checkpoint + 1);
    }

    #[test]
    fn only_one_controller_at_a_time() {
        let _serial = SERIAL.lock();
        let manager = Arc::new(LocalServiceManager::new());
        let first = ServiceController::new(ServiceConfig::new("first"), manager.clone()).unwrap();
        assert!(matches!(
            ServiceController::new(ServiceConfig::new("second"), manager.clone()),
            Err(Error::ControllerAlreadyActive)
        ));
        drop(first);
        ServiceController::new(ServiceConfig::new("second"), manager).unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let _serial = SERIAL.lock();
        let manager = Arc::new(LocalServiceManager::new());
        assert!(matches!(
            ServiceController::new(ServiceConfig::new(""), manager),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn report_without_registration_changes_nothing() {
        let _serial = SERIAL.lock();
        let manager = Arc::new(LocalServiceManager::new());
        let controller = ServiceController::new(ServiceConfig::new("svc"), manager.clone()).unwrap();

        let before = controller.status().unwrap();
        assert!(matches!(
            controller.report_status(ServiceState::StopPending),
            Err(Error::NotRegistered)
        ));
        assert_eq!(controller.status().unwrap(), before);
        assert!(manager.reports().is_empty());
    }

    #[test]
    fn unknown_raw_control_changes_nothing() {
        let _serial = SERIAL.lock();
        let manager = Arc::new(LocalServiceManager::new());
        let controller = ServiceController::new(ServiceConfig::new("svc"), manager.clone()).unwrap();

        let before = controller.status().unwrap();
        assert!(matches!(
            controller.handle_raw_control(200),
            Err(Error::ParseValue(ParseRawError::InvalidInteger(200)))
        ));
        assert_eq!(controller.status().unwrap(), before);

        controller.handle_raw_control(2).unwrap();
        assert_eq!(controller.status().unwrap().current_state, ServiceState::PausePending);
        assert!(manager.reports().is_empty());
    }

    #[test]
    fn pause_and_continue_only_record_state() {
        let _serial = SERIAL.lock();
        let manager = Arc::new(LocalServiceManager::new());
        let controller = ServiceController::new(ServiceConfig::new("svc"), manager.clone()).unwrap();

        controller.handle_control(ServiceControl::Pause).unwrap();
        assert_eq!(controller.status().unwrap().current_state, ServiceState::PausePending);
        controller.handle_control(ServiceControl::Continue).unwrap();
        assert_eq!(
            controller.status().unwrap().current_state,
            ServiceState::ContinuePending
        );
        assert!(manager.reports().is_empty());
    }

    #[test]
    fn stop_before_registration_still_raises_shutdown() {
        let _serial = SERIAL.lock();
        let manager = Arc::new(LocalServiceManager::new());
        manager.reject_dispatcher(true);
        let controller = ServiceController::new(ServiceConfig::new("svc"), manager).unwrap();
        let shutdown = ShutdownSignal::new();

        let result = controller.start(
            ServiceLaunch::new()
                .shutdown_signal(shutdown.clone())
                .entry_point(|_| {}),
        );
        assert!(matches!(result, Err(Error::DispatcherRegistration(_))));
        assert_eq!(controller.status().unwrap().current_state, ServiceState::Stopped);

        // Without a status handle the report fails, the worker is told to stop regardless.
        assert!(matches!(
            controller.handle_control(ServiceControl::Stop),
            Err(Error::NotRegistered)
        ));
        assert!(shutdown.is_set());
        assert_eq!(controller.status().unwrap().current_state, ServiceState::StopPending);
    }

    #[test]
    fn terminate_without_worker_is_a_no_op() {
        let _serial = SERIAL.lock();
        let manager = Arc::new(LocalServiceManager::new());
        let controller = ServiceController::new(ServiceConfig::new("svc"), manager).unwrap();
        assert!(!controller.terminate_worker().unwrap());
    }
}
