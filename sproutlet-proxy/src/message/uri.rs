use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// A SIP URI scheme, either `sip` or `sips`.
#[derive(Debug, PartialEq, Eq, Clone, Default, Copy)]
pub enum Scheme {
    #[default]
    Sip,
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// A transport protocol carried in URIs, Via headers and resolver targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Udp,
    Tcp,
    Tls,
}

impl TransportType {
    /// The lowercase form used in URI `transport` parameters.
    pub fn param_str(self) -> &'static str {
        match self {
            TransportType::Udp => "udp",
            TransportType::Tcp => "tcp",
            TransportType::Tls => "tls",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Udp => f.write_str("UDP"),
            TransportType::Tcp => f.write_str("TCP"),
            TransportType::Tls => f.write_str("TLS"),
        }
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportType::Udp),
            "tcp" => Ok(TransportType::Tcp),
            "tls" => Ok(TransportType::Tls),
            other => Err(Error::Parse(format!("unknown transport '{}'", other))),
        }
    }
}

/// The host part of a URI, either a domain name or an IP literal.
///
/// Domain names are normalized to lowercase on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Domain(String),
    Ip(IpAddr),
}

impl Host {
    pub fn domain(name: &str) -> Host {
        Host::Domain(name.to_ascii_lowercase())
    }

    /// The normalized textual form used for alias comparisons.
    pub fn as_str(&self) -> String {
        match self {
            Host::Domain(d) => d.clone(),
            Host::Ip(ip) => ip.to_string(),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(d) => f.write_str(d),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Host::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

/// Ordered URI parameters, excluding the `lr` and `transport` parameters
/// which are modelled as dedicated fields on [`SipUri`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(|v| v.to_string());
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// A SIP URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: Host,
    pub port: Option<u16>,
    /// The `lr` loose-routing parameter.
    pub lr: bool,
    /// The `transport` parameter.
    pub transport: Option<TransportType>,
    /// Remaining URI parameters, in order of appearance.
    pub params: Params,
}

impl SipUri {
    pub fn new(host: Host) -> SipUri {
        SipUri {
            scheme: Scheme::Sip,
            user: None,
            host,
            port: None,
            lr: false,
            transport: None,
            params: Params::default(),
        }
    }

    pub fn with_user(mut self, user: &str) -> SipUri {
        self.user = Some(user.to_string());
        self
    }

    /// The value of the `services` URI parameter, if present and non-empty.
    pub fn services(&self) -> Option<&str> {
        self.params.get("services").filter(|v| !v.is_empty())
    }

    /// The normalized host string, for alias comparison.
    pub fn host_str(&self) -> String {
        self.host.as_str()
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(tp) = self.transport {
            write!(f, ";transport={}", tp.param_str())?;
        }
        if self.lr {
            f.write_str(";lr")?;
        }
        write!(f, "{}", self.params)
    }
}

impl FromStr for SipUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut s = s.trim();
        if s.starts_with('<') && s.ends_with('>') {
            s = &s[1..s.len() - 1];
        }

        let (scheme, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(Error::Parse(format!("URI has no sip scheme: '{}'", s)));
        };

        // URI headers are not modelled; everything after '?' is dropped.
        let rest = rest.split('?').next().unwrap_or(rest);

        let mut parts = rest.split(';');
        let addr = parts
            .next()
            .ok_or_else(|| Error::Parse("empty URI".into()))?;

        let (user, host_port) = match addr.split_once('@') {
            Some((user, hp)) if !user.is_empty() => (Some(user.to_string()), hp),
            _ => (None, addr),
        };

        let (host, port) = parse_host_port(host_port)?;

        let mut uri = SipUri {
            scheme,
            user,
            host,
            port,
            lr: false,
            transport: None,
            params: Params::default(),
        };

        for param in parts {
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((name, value)) if name.eq_ignore_ascii_case("transport") => {
                    uri.transport = Some(value.parse()?);
                }
                Some((name, value)) => uri.params.set(name, Some(value)),
                None if param.eq_ignore_ascii_case("lr") => uri.lr = true,
                None => uri.params.set(param, None),
            }
        }

        Ok(uri)
    }
}

fn parse_host_port(s: &str) -> Result<(Host, Option<u16>)> {
    if s.is_empty() {
        return Err(Error::Parse("URI has no host".into()));
    }

    // Bracketed IPv6 literal.
    if let Some(rest) = s.strip_prefix('[') {
        let (ip, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Parse(format!("unterminated IPv6 literal: '{}'", s)))?;
        let ip: Ipv6Addr = ip
            .parse()
            .map_err(|_| Error::Parse(format!("bad IPv6 literal: '{}'", ip)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if tail.is_empty() => None,
            None => return Err(Error::Parse(format!("trailing junk after host: '{}'", s))),
        };
        return Ok((Host::Ip(IpAddr::V6(ip)), port));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) => (host, Some(parse_port(port)?)),
        None => (s, None),
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        Ok((Host::Ip(ip), port))
    } else {
        Ok((Host::domain(host), port))
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| Error::Parse(format!("bad port: '{}'", s)))
}
