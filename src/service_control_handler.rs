use std::ffi::OsStr;
use std::io;

use parking_lot::Mutex;
use widestring::U16CString;
use windows_sys::Win32::System::Services;

use crate::service::ServiceStatus;
use crate::service_manager::ControlHandlerFn;
use crate::status_handle::StatusHandle;
use crate::{Error, Result};

/// Control handler registered for the service.
static CONTROL_HANDLER: Mutex<Option<ControlHandlerFn>> = parking_lot::const_mutex(None);

/// Static callback invoked by the system for each control request.
unsafe extern "system" fn ffi_control_handler(control: u32) {
    let handler = *CONTROL_HANDLER.lock();
    if let Some(handler) = handler {
        handler(control);
    }
}

/// Register a control handler for the service and return the status handle used to report
/// status.
///
/// Must be called from within service main.
pub fn register(service_name: impl AsRef<OsStr>, handler: ControlHandlerFn) -> Result<StatusHandle> {
    let service_name = U16CString::from_os_str(service_name)
        .map_err(|_| Error::ArgumentHasNulByte("service name"))?;
    *CONTROL_HANDLER.lock() = Some(handler);

    let raw_handle = unsafe {
        Services::RegisterServiceCtrlHandlerW(service_name.as_ptr(), Some(ffi_control_handler))
    };

    StatusHandle::from_raw(raw_handle).ok_or_else(|| {
        let last_error = io::Error::last_os_error();
        *CONTROL_HANDLER.lock() = None;
        Error::HandlerRegistration(last_error)
    })
}

/// Submit a status record through the handle obtained from [`register`].
pub fn set_service_status(handle: &StatusHandle, status: &ServiceStatus) -> Result<()> {
    let raw_status = to_raw_status(status);
    let result = unsafe { Services::SetServiceStatus(handle.raw_handle(), &raw_status) };

    if result == 0 {
        Err(Error::StatusReport(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

fn to_raw_status(status: &ServiceStatus) -> Services::SERVICE_STATUS {
    let (win32_exit_code, service_specific_exit_code) = status.exit_code.to_raw();
    Services::SERVICE_STATUS {
        dwServiceType: Services::SERVICE_WIN32_OWN_PROCESS,
        dwCurrentState: status.current_state.to_raw(),
        dwControlsAccepted: status.controls_accepted.bits(),
        dwWin32ExitCode: win32_exit_code,
        dwServiceSpecificExitCode: service_specific_exit_code,
        dwCheckPoint: status.checkpoint,
        dwWaitHint: status.wait_hint_millis(),
    }
}
