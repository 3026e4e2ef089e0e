use std::ffi::OsString;

use crate::service::ServiceStatus;
use crate::status_handle::StatusHandle;
use crate::Result;

/// Service main callback. Receives the service start arguments.
///
/// Callbacks carry no context, so implementations resolve the process-wide service controller.
pub type ServiceMainFn = fn(Vec<OsString>);

/// Control handler callback. Receives the raw control code.
pub type ControlHandlerFn = fn(u32);

/// The operating-system facility that starts services, relays control requests to them and
/// receives their status reports.
pub trait ServiceManager: Send + Sync {
    /// Connect the calling thread to the manager as the dispatcher for `service_name`.
    ///
    /// Blocks until the manager is done with the service. The manager invokes `service_main` on
    /// a thread it provides. `arguments` are the start arguments for managers that do not
    /// supply their own.
    fn start_dispatcher(
        &self,
        service_name: &str,
        arguments: Vec<OsString>,
        service_main: ServiceMainFn,
    ) -> Result<()>;

    /// Register the handler invoked for every control request sent to `service_name`.
    fn register_control_handler(
        &self,
        service_name: &str,
        handler: ControlHandlerFn,
    ) -> Result<StatusHandle>;

    /// Submit a status record for the service registered under `handle`.
    fn set_service_status(&self, handle: &StatusHandle, status: &ServiceStatus) -> Result<()>;
}

/// The Windows Service Control Manager.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsServiceManager;

#[cfg(windows)]
impl ServiceManager for WindowsServiceManager {
    fn start_dispatcher(
        &self,
        service_name: &str,
        _arguments: Vec<OsString>,
        service_main: ServiceMainFn,
    ) -> Result<()> {
        // The SCM passes its own start arguments to service main.
        crate::service_dispatcher::start(service_name, service_main)
    }

    fn register_control_handler(
        &self,
        service_name: &str,
        handler: ControlHandlerFn,
    ) -> Result<StatusHandle> {
        crate::service_control_handler::register(service_name, handler)
    }

    fn set_service_status(&self, handle: &StatusHandle, status: &ServiceStatus) -> Result<()> {
        crate::service_control_handler::set_service_status(handle, status)
    }
}
