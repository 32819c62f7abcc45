use core::fmt;
use std::net::IpAddr;

use http::uri::Uri;

use crate::error::Error;

/// url scheme accepted for client origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// validated `scheme://host[:port]` target a client connects to.
///
/// path, query and fragment components are rejected. the request path is per
/// request, not part of the origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Origin {
    pub fn parse(url: &str) -> Result<Self, Error> {
        let uri = url
            .parse::<Uri>()
            .map_err(|e| Error::invalid(format!("invalid origin url: {e}")))?;

        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => return Err(Error::invalid(format!("unsupported scheme: {other}"))),
            None => return Err(Error::invalid("origin url is missing a scheme")),
        };

        let host = uri
            .host()
            .ok_or_else(|| Error::invalid("origin url is missing a host"))?;

        match uri.path_and_query() {
            Some(pq) if pq.as_str() != "/" && !pq.as_str().is_empty() => {
                return Err(Error::invalid("origin url must not carry a path or query"));
            }
            _ => {}
        }

        Ok(Self {
            scheme,
            // strip ipv6 brackets. they are re-added when formatting authority.
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: uri.port_u16().unwrap_or_else(|| scheme.default_port()),
        })
    }

    /// split an absolute url into its origin and the request target
    /// (path plus query, `/` when absent).
    pub fn parse_with_path(url: &str) -> Result<(Self, String), Error> {
        let uri = url
            .parse::<Uri>()
            .map_err(|e| Error::invalid(format!("invalid url: {e}")))?;

        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let scheme = uri.scheme_str().map(str::to_string);
        let host = uri.host().map(str::to_string);
        let port = uri.port_u16();

        let origin_url = match (scheme.as_deref(), host.as_deref(), port) {
            (Some(s), Some(h), Some(p)) => format!("{s}://{h}:{p}"),
            (Some(s), Some(h), None) => format!("{s}://{h}"),
            _ => return Err(Error::invalid("url must be absolute")),
        };

        Ok((Self::parse(&origin_url)?, path))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.scheme, Scheme::Https)
    }

    /// hostname used for SNI and certificate verification. `None` for ip
    /// literal hosts, which carry no name to verify.
    pub fn default_servername(&self) -> Option<&str> {
        if self.host.parse::<IpAddr>().is_ok() {
            None
        } else {
            Some(&self.host)
        }
    }

    /// value for the `host` header. default ports are elided.
    pub fn host_header(&self) -> String {
        let host = self.authority_host();
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// `host:port` form suitable for socket address lookup.
    pub(crate) fn addr(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    fn authority_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority_host())?;
        if self.port != self.scheme.default_port() {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for Origin {
    type Error = Error;

    fn try_from(url: &str) -> Result<Self, Error> {
        Self::parse(url)
    }
}
