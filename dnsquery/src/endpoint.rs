//! Normalized resolver endpoints.
//!
//! An [`Endpoint`] is built either from a string such as
//! `https://dns.google/dns-query`, `udp://1.1.1.1` or `dns.quad9.net`, or from
//! an [`EndpointDescriptor`] found in the resolver registry. Once built it is
//! never mutated; queries share it as `Arc<Endpoint>`.

use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

const DEFAULT_DOH_PATH: &str = "/dns-query";
const DEFAULT_UDP_PORT: u16 = 53;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp4,
    Udp6,
    Https,
    Http,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp4 => "udp4",
            Protocol::Udp6 => "udp6",
            Protocol::Https => "https",
            Protocol::Http => "http",
        }
    }

    pub fn is_doh(self) -> bool {
        matches!(self, Protocol::Https | Protocol::Http)
    }

    pub fn is_udp(self) -> bool {
        matches!(self, Protocol::Udp4 | Protocol::Udp6)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method used for a DoH exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Post,
    Get,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Post => "POST",
            Method::Get => "GET",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "post" => Ok(Method::Post),
            "get" => Ok(Method::Get),
            other => Err(Error::invalid_input(format!(
                "unsupported http method: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Doh {
        url: Url,
        method: Method,
        /// Connect here instead of resolving the url host.
        address: Option<IpAddr>,
    },
    Udp {
        host: String,
        port: u16,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    protocol: Protocol,
    name: Option<String>,
    transport: Transport,
}

impl Endpoint {
    pub fn doh(url: Url, method: Method) -> Result<Self, Error> {
        let protocol = match url.scheme() {
            "https" => Protocol::Https,
            "http" => Protocol::Http,
            other => {
                return Err(Error::invalid_input(format!(
                    "unsupported DoH scheme: {other}"
                )))
            }
        };
        if url.host_str().is_none() {
            return Err(Error::invalid_input(format!("missing host in {url}")));
        }
        Ok(Endpoint {
            protocol,
            name: None,
            transport: Transport::Doh {
                url,
                method,
                address: None,
            },
        })
    }

    pub fn udp(protocol: Protocol, host: impl Into<String>, port: u16) -> Result<Self, Error> {
        if !protocol.is_udp() {
            return Err(Error::invalid_input(format!(
                "{protocol} is not a udp protocol"
            )));
        }
        let host = host.into();
        if host.is_empty() {
            return Err(Error::invalid_input("missing udp host"));
        }
        Ok(Endpoint {
            protocol,
            name: None,
            transport: Transport::Udp { host, port },
        })
    }

    /// UDP endpoint for a literal address; the protocol follows the address family.
    pub fn udp_addr(ip: IpAddr, port: u16) -> Self {
        let protocol = match ip {
            IpAddr::V4(_) => Protocol::Udp4,
            IpAddr::V6(_) => Protocol::Udp6,
        };
        Endpoint {
            protocol,
            name: None,
            transport: Transport::Udp {
                host: ip.to_string(),
                port,
            },
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_address(mut self, ip: IpAddr) -> Self {
        if let Transport::Doh { address, .. } = &mut self.transport {
            *address = Some(ip);
        }
        self
    }

    pub fn from_descriptor(descriptor: &EndpointDescriptor) -> Result<Self, Error> {
        match descriptor {
            EndpointDescriptor::Url(s) => s.parse(),
            EndpointDescriptor::Props(props) => props.to_endpoint(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn url(&self) -> Option<&Url> {
        match &self.transport {
            Transport::Doh { url, .. } => Some(url),
            Transport::Udp { .. } => None,
        }
    }

    pub fn method(&self) -> Option<Method> {
        match &self.transport {
            Transport::Doh { method, .. } => Some(*method),
            Transport::Udp { .. } => None,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transport {
            Transport::Doh { url, method, .. } => {
                write!(f, "{url}")?;
                if *method == Method::Get {
                    f.write_str(" [get]")?;
                }
                Ok(())
            }
            Transport::Udp { host, port } => {
                if host.contains(':') {
                    write!(f, "{}://[{}]:{}", self.protocol, host, port)
                } else {
                    write!(f, "{}://{}:{}", self.protocol, host, port)
                }
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::invalid_input("empty endpoint"));
        }
        let (body, method) = split_method(s)?;
        let (scheme, rest) = match body.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("https".to_string(), body),
        };
        match scheme.as_str() {
            "https" | "http" => {
                let url = doh_url(&scheme, rest)?;
                Endpoint::doh(url, method.unwrap_or_default())
            }
            "udp" | "udp4" | "udp6" => {
                if method.is_some() {
                    return Err(Error::invalid_input(format!(
                        "http method is not supported for {s}"
                    )));
                }
                let (host, port) = split_host_port(rest)?;
                let protocol = match scheme.as_str() {
                    "udp4" => Protocol::Udp4,
                    "udp6" => Protocol::Udp6,
                    _ if host.parse::<Ipv6Addr>().is_ok() => Protocol::Udp6,
                    _ => Protocol::Udp4,
                };
                Endpoint::udp(protocol, host, port.unwrap_or(DEFAULT_UDP_PORT))
            }
            other => Err(Error::invalid_input(format!(
                "unsupported endpoint protocol: {other}"
            ))),
        }
    }
}

/// Splits a trailing ` [post]` / ` [get]` off an endpoint string.
fn split_method(s: &str) -> Result<(&str, Option<Method>), Error> {
    if !s.ends_with(']') {
        return Ok((s, None));
    }
    match s.rfind(" [") {
        Some(idx) => {
            let method = s[idx + 2..s.len() - 1].parse()?;
            Ok((s[..idx].trim_end(), Some(method)))
        }
        // `udp://[::1]` ends with a bracket too
        None => Ok((s, None)),
    }
}

fn doh_url(scheme: &str, rest: &str) -> Result<Url, Error> {
    let mut url = Url::parse(&format!("{scheme}://{rest}"))
        .map_err(|e| Error::invalid_input(format!("invalid endpoint url {rest}: {e}")))?;
    let authority = rest.split(['?', '#']).next().unwrap_or(rest);
    if !authority.contains('/') {
        url.set_path(DEFAULT_DOH_PATH);
    }
    Ok(url)
}

fn split_host_port(s: &str) -> Result<(String, Option<u16>), Error> {
    let s = s.trim_end_matches('/');
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| Error::invalid_input(format!("invalid port in {s}")))
    };
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::invalid_input(format!("unterminated ipv6 address in {s}")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None if tail.is_empty() => None,
            None => return Err(Error::invalid_input(format!("invalid address {s}"))),
        };
        return Ok((host.to_string(), port));
    }
    match s.matches(':').count() {
        0 => Ok((s.to_string(), None)),
        1 => {
            let (host, port) = s.split_once(':').unwrap_or((s, ""));
            Ok((host.to_string(), Some(parse_port(port)?)))
        }
        // bare ipv6 literal
        _ => Ok((s.to_string(), None)),
    }
}

/// Endpoint as written in the resolver registry: either an endpoint string or
/// an object describing its parts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointDescriptor {
    Url(String),
    Props(EndpointProps),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointProps {
    /// `https`, `http`, `udp`, `udp4` or `udp6`, optionally followed by `:`.
    pub protocol: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
}

impl EndpointProps {
    fn to_endpoint(&self) -> Result<Endpoint, Error> {
        let protocol = self.protocol.trim_end_matches(':').to_ascii_lowercase();
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match protocol.as_str() {
            "https" | "http" => {
                let mut url = Url::parse(&format!("{protocol}://{host}")).map_err(|e| {
                    Error::invalid_input(format!("invalid endpoint host {}: {e}", self.host))
                })?;
                if let Some(port) = self.port {
                    url.set_port(Some(port)).map_err(|_| {
                        Error::invalid_input(format!("invalid port for {}", self.host))
                    })?;
                }
                url.set_path(self.path.as_deref().unwrap_or(DEFAULT_DOH_PATH));
                let method = match &self.method {
                    Some(method) => method.parse()?,
                    None => Method::default(),
                };
                let endpoint = Endpoint::doh(url, method)?;
                let address = self
                    .ipv4
                    .map(IpAddr::V4)
                    .or_else(|| self.ipv6.map(IpAddr::V6));
                Ok(match address {
                    Some(ip) => endpoint.with_address(ip),
                    None => endpoint,
                })
            }
            "udp" | "udp4" | "udp6" => {
                let port = self.port.unwrap_or(DEFAULT_UDP_PORT);
                let bare = self.host.trim_start_matches('[').trim_end_matches(']');
                let protocol = match protocol.as_str() {
                    "udp4" => Protocol::Udp4,
                    "udp6" => Protocol::Udp6,
                    _ if bare.parse::<Ipv6Addr>().is_ok() => Protocol::Udp6,
                    _ => Protocol::Udp4,
                };
                Endpoint::udp(protocol, bare, port)
            }
            other => Err(Error::invalid_input(format!(
                "unsupported endpoint protocol: {other}"
            ))),
        }
    }
}
