//! `host[:port]` connection strings.
//!
//! The port is kept as parsed (`i64`) and only narrowed to `u16` when the
//! socket is opened, so a constructor never rejects an unusual port value.

use anyhow::{Context, Result};
use la_core::error::{require_connection_string, DriverConstructionError};
use std::fmt;

/// A parsed network endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: i64,
}

impl Endpoint {
    /// Parse `host:port`, or `host` alone when a default port exists.
    pub fn parse(input: &str, default_port: Option<u16>) -> Result<Self, DriverConstructionError> {
        let input = require_connection_string(input)?;
        let (host, port) = match input.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.trim().parse::<i64>().map_err(|_| {
                    DriverConstructionError::malformed(input, "port is not a number")
                })?;
                (host.trim(), port)
            }
            None => match default_port {
                Some(port) => (input, i64::from(port)),
                None => {
                    return Err(DriverConstructionError::malformed(
                        input,
                        "expected host:port",
                    ))
                }
            },
        };
        if host.is_empty() {
            return Err(DriverConstructionError::malformed(input, "host is empty"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// The port as a socket port, failing for values outside `0..=65535`.
    pub fn socket_port(&self) -> Result<u16> {
        u16::try_from(self.port)
            .with_context(|| format!("port {} is outside the valid range 0-65535", self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
