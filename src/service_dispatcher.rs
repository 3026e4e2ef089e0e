use std::ffi::{OsStr, OsString};
use std::io;

use parking_lot::Mutex;
use widestring::{U16CString, WideCStr};
use windows_sys::core::PWSTR;
use windows_sys::Win32::System::Services;

use crate::service_manager::ServiceMainFn;
use crate::{Error, Result};

/// Service main registered by the running dispatcher.
static SERVICE_MAIN: Mutex<Option<ServiceMainFn>> = parking_lot::const_mutex(None);

/// Static callback used by the system to bootstrap the service.
unsafe extern "system" fn ffi_service_main(
    num_service_arguments: u32,
    service_arguments: *mut PWSTR,
) {
    let arguments = parse_service_arguments(num_service_arguments, service_arguments);
    let service_main = *SERVICE_MAIN.lock();
    match service_main {
        Some(service_main) => service_main(arguments),
        None => log::error!("Service main invoked without a registered callback"),
    }
}

/// Start service control dispatcher.
///
/// Once started the service control dispatcher blocks the current thread execution
/// until the service is stopped.
///
/// Upon successful initialization, system calls `service_main` on a background thread.
///
/// On failure: immediately returns an error, no threads are spawned. This is what happens when
/// the process was not started by the Service Control Manager.
pub fn start(service_name: impl AsRef<OsStr>, service_main: ServiceMainFn) -> Result<()> {
    let service_name = U16CString::from_os_str(service_name)
        .map_err(|_| Error::ArgumentHasNulByte("service name"))?;
    *SERVICE_MAIN.lock() = Some(service_main);

    let service_table: &[Services::SERVICE_TABLE_ENTRYW] = &[
        Services::SERVICE_TABLE_ENTRYW {
            lpServiceName: service_name.as_ptr() as PWSTR,
            lpServiceProc: Some(ffi_service_main),
        },
        // the last item has to be { null, null }
        Services::SERVICE_TABLE_ENTRYW {
            lpServiceName: std::ptr::null_mut(),
            lpServiceProc: None,
        },
    ];

    let result = unsafe { Services::StartServiceCtrlDispatcherW(service_table.as_ptr()) };
    let last_error = io::Error::last_os_error();
    *SERVICE_MAIN.lock() = None;

    if result == 0 {
        Err(Error::DispatcherRegistration(last_error))
    } else {
        Ok(())
    }
}

/// Parse raw arguments received in `service_main` into `Vec<OsString>`.
unsafe fn parse_service_arguments(argc: u32, argv: *mut PWSTR) -> Vec<OsString> {
    if argv.is_null() {
        return Vec::new();
    }
    (0..argc as usize)
        .map(|i| {
            let array_element_ptr: *mut PWSTR = argv.add(i);
            WideCStr::from_ptr_str(*array_element_ptr).to_os_string()
        })
        .collect()
}
