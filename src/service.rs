use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Win32 `ERROR_SERVICE_SPECIFIC_ERROR`.
const ERROR_SERVICE_SPECIFIC_ERROR: u32 = 1066;

bitflags::bitflags! {
    /// Flags describing which control requests the service accepts.
    ///
    /// Values follow the Win32 `SERVICE_ACCEPT_*` numbering.
    #[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ServiceControlAccept: u32 {
        /// The service can be stopped.
        const STOP = 0x0000_0001;

        /// The service can be paused and continued.
        const PAUSE_CONTINUE = 0x0000_0002;

        /// The service is notified when system shutdown occurs.
        const SHUTDOWN = 0x0000_0004;
    }
}

/// Error returned when a raw value does not match any known variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseRawError {
    #[error("invalid integer value: {0}")]
    InvalidInteger(u32),
}

/// Service state reported to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServiceState {
    Stopped = 1,
    StartPending = 2,
    StopPending = 3,
    Running = 4,
    ContinuePending = 5,
    PausePending = 6,
    Paused = 7,
}

impl ServiceState {
    /// Convert from the Win32 numeric value.
    pub fn from_raw(raw: u32) -> Result<Self, ParseRawError> {
        match raw {
            1 => Ok(ServiceState::Stopped),
            2 => Ok(ServiceState::StartPending),
            3 => Ok(ServiceState::StopPending),
            4 => Ok(ServiceState::Running),
            5 => Ok(ServiceState::ContinuePending),
            6 => Ok(ServiceState::PausePending),
            7 => Ok(ServiceState::Paused),
            _ => Err(ParseRawError::InvalidInteger(raw)),
        }
    }

    /// The Win32 numeric value.
    pub fn to_raw(self) -> u32 {
        self as u32
    }

    /// Whether a report of this state clears the progress checkpoint.
    ///
    /// Only `Running` and `Stopped` are settled; every other state is a transition the
    /// manager watches for progress.
    pub fn is_settled(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Stopped)
    }
}

/// Control request delivered by the service manager to the control handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServiceControl {
    Stop = 1,
    Pause = 2,
    Continue = 3,
    Interrogate = 4,
    Shutdown = 5,
}

impl ServiceControl {
    /// Convert from the Win32 numeric value.
    pub fn from_raw(raw: u32) -> Result<Self, ParseRawError> {
        match raw {
            1 => Ok(ServiceControl::Stop),
            2 => Ok(ServiceControl::Pause),
            3 => Ok(ServiceControl::Continue),
            4 => Ok(ServiceControl::Interrogate),
            5 => Ok(ServiceControl::Shutdown),
            _ => Err(ParseRawError::InvalidInteger(raw)),
        }
    }

    /// The Win32 numeric value.
    pub fn to_raw(self) -> u32 {
        self as u32
    }
}

/// Exit code reported along with the service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceExitCode {
    /// A Win32 error code, `0` meaning no error.
    Win32(u32),
    /// An application-specific error code.
    ServiceSpecific(u32),
}

impl ServiceExitCode {
    /// No error.
    pub const NO_ERROR: Self = ServiceExitCode::Win32(0);

    /// Classifies an application exit code: `0` is no error, anything else is service
    /// specific.
    pub fn from_application_code(code: u32) -> Self {
        if code == 0 {
            Self::NO_ERROR
        } else {
            ServiceExitCode::ServiceSpecific(code)
        }
    }

    /// Returns the `(win32_exit_code, service_specific_exit_code)` pair.
    pub fn to_raw(self) -> (u32, u32) {
        match self {
            ServiceExitCode::Win32(code) => (code, 0),
            ServiceExitCode::ServiceSpecific(code) => (ERROR_SERVICE_SPECIFIC_ERROR, code),
        }
    }
}

impl Default for ServiceExitCode {
    fn default() -> Self {
        Self::NO_ERROR
    }
}

/// Status record submitted to the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Current state of the service.
    pub current_state: ServiceState,

    /// Control requests the service claims to handle.
    pub controls_accepted: ServiceControlAccept,

    /// Exit code, relevant when the service stops.
    pub exit_code: ServiceExitCode,

    /// Progress counter for pending transitions.
    pub checkpoint: u32,

    /// Time the manager should wait before expecting the next checkpoint.
    pub wait_hint: Duration,
}

impl ServiceStatus {
    /// Wait hint in whole milliseconds, saturating at `u32::MAX`.
    pub fn wait_hint_millis(&self) -> u32 {
        u32::try_from(self.wait_hint.as_millis()).unwrap_or(u32::MAX)
    }
}
