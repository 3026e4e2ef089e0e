//! Configuration of the service controller.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::service::ServiceControlAccept;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Name the service is registered under with the service manager.
    pub service_name: String,

    /// Controls accepted once the service has left `StartPending`.
    pub accepted_controls: ServiceControlAccept,

    /// Default wait hint attached to status reports, in milliseconds.
    pub wait_hint_ms: u64,

    /// How often the worker loop is expected to check the shutdown signal, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            accepted_controls: ServiceControlAccept::STOP,
            wait_hint_ms: 3000,
            poll_interval_ms: 1000,
        }
    }
}

impl ServiceConfig {
    /// Defaults for a service registered as `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `SERVICE_NAME`, `SERVICE_ACCEPTED_CONTROLS`,
    /// `SERVICE_WAIT_HINT_MS` and `SERVICE_POLL_INTERVAL_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(name) = lookup("SERVICE_NAME") {
            log::info!("Service name from environment: {}", name);
            config.service_name = name;
        }
        if let Some(controls) = lookup("SERVICE_ACCEPTED_CONTROLS") {
            config.accepted_controls = bitflags::parser::from_str::<ServiceControlAccept>(&controls)
                .map_err(|e| Error::InvalidConfig {
                    field: "accepted_controls",
                    reason: e.to_string(),
                })?;
        }
        if let Some(value) = lookup("SERVICE_WAIT_HINT_MS") {
            config.wait_hint_ms = parse_field("wait_hint_ms", &value)?;
        }
        if let Some(value) = lookup("SERVICE_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_field("poll_interval_ms", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values the controller relies on.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(Error::InvalidConfig {
                field: "service_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.service_name.contains('\0') {
            return Err(Error::ArgumentHasNulByte("service name"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig {
                field: "poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Default wait hint attached to status reports.
    pub fn wait_hint(&self) -> Duration {
        Duration::from_millis(self.wait_hint_ms)
    }

    /// Interval at which the worker loop checks the shutdown signal.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::InvalidConfig {
        field,
        reason: format!("{:?}: {}", value, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_accept_stop_only() {
        let config = ServiceConfig::default();
        assert_eq!(config.accepted_controls, ServiceControlAccept::STOP);
        assert_eq!(config.wait_hint(), Duration::from_millis(3000));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "webserver"),
            ("SERVICE_ACCEPTED_CONTROLS", "STOP | SHUTDOWN"),
            ("SERVICE_WAIT_HINT_MS", "5000"),
            ("SERVICE_POLL_INTERVAL_MS", " 250 "),
        ]))
        .unwrap();
        assert_eq!(config.service_name, "webserver");
        assert_eq!(
            config.accepted_controls,
            ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
        );
        assert_eq!(config.wait_hint_ms, 5000);
        assert_eq!(config.poll_interval_ms, 250);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ServiceConfig::from_lookup(lookup(&[("SERVICE_WAIT_HINT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { field: "wait_hint_ms", .. }));

        let err = ServiceConfig::from_lookup(lookup(&[("SERVICE_ACCEPTED_CONTROLS", "RESTART")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { field: "accepted_controls", .. }));

        let err = ServiceConfig::from_lookup(lookup(&[("SERVICE_POLL_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { field: "poll_interval_ms", .. }));
    }

    #[test]
    fn nul_in_name_is_rejected() {
        let config = ServiceConfig::new("bad\0name");
        assert!(matches!(config.validate(), Err(Error::ArgumentHasNulByte(_))));
    }

    #[test]
    fn deserializes_with_missing_fields() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"service_name":"ftpd","accepted_controls":"STOP | SHUTDOWN"}"#)
                .unwrap();
        assert_eq!(config.service_name, "ftpd");
        assert_eq!(
            config.accepted_controls,
            ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
        );
        assert_eq!(config.wait_hint_ms, 3000);
    }
}
