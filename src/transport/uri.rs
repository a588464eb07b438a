//! `opc.tcp://` endpoint URL parsing.
//!
//! An endpoint URL names the host and port of the service plus an optional
//! path component used as the application name:
//! `opc.tcp://host[:port][/name]`. The default port is 4840.

use crate::config::DEFAULT_PORT;
use crate::error::{Result, UaError};

pub const SCHEME: &str = "opc.tcp";

/// Parsed endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    raw: String,
    host: String,
    port: u16,
    application_name: Option<String>,
}

impl EndpointUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| {
                UaError::BadEndpointUrl(format!("expected scheme '{SCHEME}://': {url}"))
            })?;

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };

        if authority.is_empty() {
            return Err(UaError::BadEndpointUrl(format!("missing host: {url}")));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !p.is_empty() => {
                let port = p.parse::<u16>().map_err(|_| {
                    UaError::BadEndpointUrl(format!("invalid port '{p}': {url}"))
                })?;
                (h, port)
            }
            _ => (authority, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(UaError::BadEndpointUrl(format!("missing host: {url}")));
        }

        let application_name = if path.is_empty() {
            None
        } else {
            Some(path.trim_end_matches('/').to_string())
        };

        Ok(Self {
            raw: url.to_string(),
            host: host.to_string(),
            port,
            application_name,
        })
    }

    /// The URL exactly as configured.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path component, if any.
    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    /// `host:port` form accepted by the socket API.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_url() {
        let url = EndpointUrl::parse("opc.tcp://plant.local:4841/line1").unwrap();
        assert_eq!(url.host(), "plant.local");
        assert_eq!(url.port(), 4841);
        assert_eq!(url.application_name(), Some("line1"));
        assert_eq!(url.socket_addr(), "plant.local:4841");
    }

    #[test]
    fn default_port_applied() {
        let url = EndpointUrl::parse("opc.tcp://localhost").unwrap();
        assert_eq!(url.port(), 4840);
        assert_eq!(url.application_name(), None);
    }

    #[test]
    fn wrong_scheme_rejected() {
        assert!(EndpointUrl::parse("http://localhost:4840").is_err());
        assert!(EndpointUrl::parse("opc.tcp:/localhost").is_err());
    }

    #[test]
    fn bad_port_rejected() {
        assert!(EndpointUrl::parse("opc.tcp://host:notaport").is_err());
        assert!(EndpointUrl::parse("opc.tcp://host:99999").is_err());
    }

    #[test]
    fn missing_host_rejected() {
        assert!(EndpointUrl::parse("opc.tcp://").is_err());
        assert!(EndpointUrl::parse("opc.tcp://:4840").is_err());
    }

    #[test]
    fn display_preserves_raw() {
        let raw = "opc.tcp://127.0.0.1:4840/demo";
        assert_eq!(EndpointUrl::parse(raw).unwrap().to_string(), raw);
    }
}
