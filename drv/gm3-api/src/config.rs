// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway configuration, sourced from the environment.
//!
//! Every recognised variable has a default suitable for the shipped
//! udev rule (`/dev/econext`) and systemd unit; a malformed value is a
//! startup error rather than a silent fallback.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// `SERIAL_PORT`: serial device path.
    pub serial_port: String,
    /// `SERIAL_BAUD`: target baud rate after the toggle reset.
    pub serial_baud: u32,
    /// `API_HOST`/`API_PORT`: bind address for the HTTP collaborator.
    pub api_host: String,
    pub api_port: u16,
    /// `POLL_INTERVAL`: seconds between value refresh rounds.
    pub poll_interval: Duration,
    /// `TOKEN_REQUIRED`: when false, transmit on observed bus idle
    /// instead of waiting for a token grant.
    pub token_required: bool,
    /// `DESTINATION_ADDRESS`: controller bus address.
    pub controller_addr: u16,
    /// `REQUEST_TIMEOUT`: per-attempt reply timeout, seconds.
    pub request_timeout: Duration,
    /// `PARAMS_PER_REQUEST`: poll page size; lower it for headroom on
    /// noisy buses.
    pub params_per_request: u16,
    /// `STATE_DIR`: directory holding `paired_address`.
    pub state_dir: PathBuf,
    /// `HEALTH_WINDOW`: seconds without a parsed frame before health
    /// reports disconnected.
    pub health_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: "/dev/econext".to_owned(),
            serial_baud: 115_200,
            api_host: "0.0.0.0".to_owned(),
            api_port: 8000,
            poll_interval: Duration::from_secs(10),
            token_required: true,
            controller_addr: drv_gm3_proto::DEFAULT_CONTROLLER_ADDR,
            request_timeout: Duration::from_millis(1500),
            params_per_request: 100,
            state_dir: PathBuf::from("/var/lib/gm3-gateway"),
            health_window: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub reason: String,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "bad value for {}: {}", self.var, self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = env("SERIAL_PORT") {
            cfg.serial_port = v;
        }
        if let Some(v) = env("SERIAL_BAUD") {
            cfg.serial_baud = parse("SERIAL_BAUD", &v)?;
        }
        if let Some(v) = env("API_HOST") {
            cfg.api_host = v;
        }
        if let Some(v) = env("API_PORT") {
            cfg.api_port = parse("API_PORT", &v)?;
        }
        if let Some(v) = env("POLL_INTERVAL") {
            cfg.poll_interval = secs("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = env("TOKEN_REQUIRED") {
            cfg.token_required = boolean("TOKEN_REQUIRED", &v)?;
        }
        if let Some(v) = env("DESTINATION_ADDRESS") {
            cfg.controller_addr = parse("DESTINATION_ADDRESS", &v)?;
        }
        if let Some(v) = env("REQUEST_TIMEOUT") {
            cfg.request_timeout = secs("REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = env("PARAMS_PER_REQUEST") {
            cfg.params_per_request = parse("PARAMS_PER_REQUEST", &v)?;
            if cfg.params_per_request == 0 {
                return Err(ConfigError {
                    var: "PARAMS_PER_REQUEST",
                    reason: "must be at least 1".to_owned(),
                });
            }
        }
        if let Some(v) = env("STATE_DIR") {
            cfg.state_dir = PathBuf::from(v);
        }
        if let Some(v) = env("HEALTH_WINDOW") {
            cfg.health_window = secs("HEALTH_WINDOW", &v)?;
        }

        Ok(cfg)
    }

    /// Path of the persisted claimed-address file.
    pub fn paired_address_path(&self) -> PathBuf {
        self.state_dir.join("paired_address")
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(
    var: &'static str,
    raw: &str,
) -> Result<T, ConfigError>
where
    T::Err: core::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError {
        var,
        reason: e.to_string(),
    })
}

/// Seconds, fractional values allowed (`REQUEST_TIMEOUT=1.5`).
fn secs(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let v: f64 = parse(var, raw)?;
    if !v.is_finite() || v <= 0.0 {
        return Err(ConfigError {
            var,
            reason: "must be a positive number of seconds".to_owned(),
        });
    }
    Ok(Duration::from_secs_f64(v))
}

fn boolean(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError {
            var,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.serial_port, "/dev/econext");
        assert_eq!(cfg.serial_baud, 115_200);
        assert_eq!(cfg.poll_interval, Duration::from_secs(10));
        assert!(cfg.token_required);
        assert_eq!(cfg.controller_addr, 1);
        assert_eq!(cfg.request_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.params_per_request, 100);
        assert_eq!(
            cfg.paired_address_path(),
            PathBuf::from("/var/lib/gm3-gateway/paired_address")
        );
    }

    #[test]
    fn parsers() {
        assert_eq!(boolean("X", "TRUE"), Ok(true));
        assert_eq!(boolean("X", "0"), Ok(false));
        assert!(boolean("X", "maybe").is_err());

        assert_eq!(secs("X", "1.5"), Ok(Duration::from_millis(1500)));
        assert_eq!(secs("X", "10"), Ok(Duration::from_secs(10)));
        assert!(secs("X", "-1").is_err());
        assert!(secs("X", "0").is_err());
        assert!(parse::<u16>("X", "70000").is_err());
    }
}
