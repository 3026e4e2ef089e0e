//! Ping service example.
//!
//! The service logs a heartbeat once per poll interval until it is asked to stop.
//!
//! Under Windows, started by the Service Control Manager, it runs as a real service. Run with
//! `--console` (or on any other platform) it runs in the foreground under the in-process
//! manager and stops on Ctrl-C.
//!
//! Configuration comes from `SERVICE_NAME`, `SERVICE_ACCEPTED_CONTROLS`,
//! `SERVICE_WAIT_HINT_MS` and `SERVICE_POLL_INTERVAL_MS`; log level from `RUST_LOG`.

use std::env;
use std::ffi::OsString;
use std::sync::Arc;

use log::{error, info};
use service_lifecycle::config::ServiceConfig;
use service_lifecycle::controller::{ServiceController, ServiceLaunch, StatusReporter};
use service_lifecycle::service_manager::ServiceManager;
use service_lifecycle::shutdown::ShutdownSignal;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let console = env::args().any(|arg| arg == "--console");
    let config = ServiceConfig::from_env()?;
    let poll_interval = config.poll_interval();

    let manager = service_manager(console)?;
    let controller = ServiceController::new(config, manager)?;
    let reporter = controller.reporter();
    let shutdown = ShutdownSignal::new();
    let worker_shutdown = shutdown.clone();

    let launch = ServiceLaunch::new()
        .arguments(env::args_os().collect())
        .shutdown_signal(shutdown)
        .entry_point(move |arguments| {
            run_service(arguments, &worker_shutdown, poll_interval, &reporter)
        });

    if let Err(e) = controller.start(launch) {
        error!("Service failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn run_service(
    arguments: Vec<OsString>,
    shutdown: &ShutdownSignal,
    poll_interval: std::time::Duration,
    reporter: &StatusReporter,
) {
    info!("Ping service started with arguments {:?}", arguments);

    let mut pings: u64 = 0;
    while !shutdown.wait_timeout(poll_interval) {
        pings += 1;
        info!("ping #{}", pings);
    }

    info!("Ping service exiting after {} pings", pings);
    if let Err(e) = reporter.stop() {
        error!("Failed to report the service as stopped: {}", e);
    }
}

#[cfg(windows)]
fn service_manager(console: bool) -> Result<Arc<dyn ServiceManager>, Box<dyn std::error::Error>> {
    if console {
        console_manager()
    } else {
        Ok(Arc::new(
            service_lifecycle::service_manager::WindowsServiceManager,
        ))
    }
}

#[cfg(not(windows))]
fn service_manager(_console: bool) -> Result<Arc<dyn ServiceManager>, Box<dyn std::error::Error>> {
    console_manager()
}

fn console_manager() -> Result<Arc<dyn ServiceManager>, Box<dyn std::error::Error>> {
    let manager = service_lifecycle::local_manager::LocalServiceManager::new();
    service_lifecycle::console::forward_console_signals(&manager)?;
    info!("Running in console mode, press Ctrl-C to stop");
    Ok(Arc::new(manager))
}
