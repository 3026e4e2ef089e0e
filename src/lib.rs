//! Run a long-running application as an operating-system managed service.
//!
//! The crate is built around [`controller::ServiceController`]: it registers with a
//! [`service_manager::ServiceManager`], reports status transitions, runs the application entry
//! point on a background [`worker::WorkerHandle`] and translates control requests from the
//! manager into state changes and a shared [`shutdown::ShutdownSignal`].
//!
//! On Windows the manager is the Service Control Manager
//! (`service_manager::WindowsServiceManager`). On every platform the in-process
//! [`local_manager::LocalServiceManager`] can stand in for it, which is how console mode and the
//! tests drive the controller.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use service_lifecycle::config::ServiceConfig;
//! use service_lifecycle::controller::{ServiceController, ServiceLaunch};
//! use service_lifecycle::local_manager::LocalServiceManager;
//! use service_lifecycle::shutdown::ShutdownSignal;
//!
//! fn main() -> service_lifecycle::Result<()> {
//!     let manager = LocalServiceManager::new();
//!     let controller = ServiceController::new(ServiceConfig::default(), Arc::new(manager))?;
//!     let reporter = controller.reporter();
//!     let shutdown = ShutdownSignal::new();
//!     let worker_shutdown = shutdown.clone();
//!
//!     controller.start(
//!         ServiceLaunch::new()
//!             .arguments(vec!["app".into()])
//!             .shutdown_signal(shutdown)
//!             .entry_point(move |_arguments| {
//!                 while !worker_shutdown.wait_timeout(std::time::Duration::from_secs(1)) {
//!                     // application work
//!                 }
//!                 let _ = reporter.stop();
//!             }),
//!     )
//! }
//! ```

#![deny(rust_2018_idioms)]

use std::io;

pub mod config;
pub mod console;
pub mod controller;
pub mod local_manager;
pub mod service;
pub mod service_manager;
pub mod shutdown;
pub mod status_handle;
pub mod sync;
pub mod worker;

#[cfg(windows)]
pub mod service_control_handler;
#[cfg(windows)]
pub mod service_dispatcher;

/// Errors returned by the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `start` was called without a shutdown signal.
    #[error("no shutdown signal was provided")]
    MissingShutdownSignal,

    /// `start` was called without an application entry point.
    #[error("no entry point was provided")]
    MissingEntryPoint,

    /// Another service controller is already live in this process.
    #[error("a service controller is already active in this process")]
    ControllerAlreadyActive,

    /// A string argument contains an interior nul byte.
    #[error("{0} contains a nul byte")]
    ArgumentHasNulByte(&'static str),

    /// The service manager refused to start the dispatcher for the service.
    #[error("failed to connect to the service manager")]
    DispatcherRegistration(#[source] io::Error),

    /// The service manager refused to register the control handler.
    #[error("failed to register the service control handler")]
    HandlerRegistration(#[source] io::Error),

    /// The service does not currently accept the control request.
    #[error("control code {0} is not accepted by the service")]
    ControlNotAccepted(u32),

    /// A status report was attempted before the control handler was registered.
    #[error("the service is not registered with the service manager")]
    NotRegistered,

    /// The service manager rejected a status report.
    #[error("failed to report service status")]
    StatusReport(#[source] io::Error),

    /// The worker thread could not be created.
    #[error("failed to launch worker")]
    WorkerLaunch(#[source] io::Error),

    /// The worker entry point panicked.
    #[error("worker panicked")]
    WorkerPanicked,

    /// The worker thread could not be terminated.
    #[error("failed to terminate worker")]
    WorkerTerminate(#[source] io::Error),

    /// A lock was acquired again by the context already holding it.
    #[error("lock is already held by the calling context {0}")]
    LockReentered(u64),

    /// A configuration value is out of range.
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: String,
    },

    /// The console signal handler could not be installed.
    #[error("failed to install console signal handler")]
    SignalHandler(#[from] ctrlc::Error),

    /// A raw value does not map to a known variant.
    #[error("invalid raw value: {0}")]
    ParseValue(#[from] service::ParseRawError),
}

pub type Result<T> = std::result::Result<T, Error>;
