//! URL validation for outbound HTTP (SSRF protection)
//!
//! Provides a blocklist-based security model for network access: private,
//! loopback and link-local targets are refused unless explicitly allowed.
//!
//! # Security Mitigations
//!
//! - **Header smuggling**: URLs containing CR, LF or NUL are rejected
//! - **Scheme abuse**: only `http` and `https` are allowed by default
//!   (`file://`, `gopher://`, `ftp://` are refused)
//! - **Internal targets**: RFC1918, loopback and link-local addresses (IPv4
//!   and IPv6, including IPv4-mapped IPv6) are refused
//! - **Alternate IP spellings**: hosts such as `0x7f000001` are normalized by
//!   the WHATWG URL parser and re-checked as IP literals
//! - **Userinfo confusion**: in `http://example.com@127.0.0.1/` the checked
//!   host is `127.0.0.1`

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::{Error, Result};
use crate::limits::MAX_URL_LENGTH;

/// An IP network in CIDR notation (`10.0.0.0/8`, `fe80::/10`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Create a network, masking host bits off `addr`.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let addr = match addr {
            IpAddr::V4(v4) if prefix <= 32 => {
                IpAddr::V4((u32::from(v4) & v4_mask(prefix)).into())
            }
            IpAddr::V6(v6) if prefix <= 128 => {
                IpAddr::V6((u128::from(v6) & v6_mask(prefix)).into())
            }
            _ => return Err(Error::validation(format!("invalid CIDR: prefix /{prefix}"))),
        };
        Ok(Self { addr, prefix })
    }

    /// Whether `ip` lies inside this network.
    ///
    /// IPv4-mapped IPv6 addresses are compared as IPv4.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & v4_mask(self.prefix) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for IpNetwork {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::validation(format!("invalid CIDR: {s}"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Networks blocked by the default policy.
const DEFAULT_BLOCKED_NETWORKS: &[&str] = &[
    "127.0.0.0/8",    // loopback
    "10.0.0.0/8",     // private class A
    "172.16.0.0/12",  // private class B
    "192.168.0.0/16", // private class C
    "169.254.0.0/16", // link-local (cloud metadata)
    "0.0.0.0/8",      // "this network", reaches localhost on most stacks
    "::1/128",        // IPv6 loopback
    "::/128",         // IPv6 unspecified
    "fc00::/7",       // IPv6 unique local
    "fe80::/10",      // IPv6 link-local
];

const DEFAULT_BLOCKED_HOSTS: &[&str] = &["localhost", "localhost.localdomain"];

/// URL validator guarding outbound requests.
///
/// # Example
///
/// ```rust
/// use swrt::UrlValidator;
///
/// let validator = UrlValidator::new();
/// assert!(validator.validate("https://example.com/").is_ok());
/// assert!(validator.validate("http://169.254.169.254/latest/").is_err());
///
/// let permissive = UrlValidator::permissive();
/// assert!(permissive.validate("http://127.0.0.1:8080/").is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct UrlValidator {
    blocked_networks: Vec<IpNetwork>,
    blocked_hosts: Vec<String>,
    allowed_schemes: Vec<String>,
    allow_private: bool,
    allow_loopback: bool,
    allow_link_local: bool,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self {
            blocked_networks: DEFAULT_BLOCKED_NETWORKS
                .iter()
                .filter_map(|cidr| cidr.parse().ok())
                .collect(),
            blocked_hosts: DEFAULT_BLOCKED_HOSTS.iter().map(|h| h.to_string()).collect(),
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            allow_private: false,
            allow_loopback: false,
            allow_link_local: false,
        }
    }
}

impl UrlValidator {
    /// Create a validator with the default (restrictive) policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a validator with empty blocklists and private, loopback and
    /// link-local targets allowed. Scheme restrictions still apply.
    pub fn permissive() -> Self {
        Self {
            blocked_networks: Vec::new(),
            blocked_hosts: Vec::new(),
            allow_private: true,
            allow_loopback: true,
            allow_link_local: true,
            ..Self::default()
        }
    }

    /// Replace the allowed scheme list.
    pub fn set_allowed_schemes<I, S>(&mut self, schemes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_schemes = schemes.into_iter().map(Into::into).collect();
    }

    /// Block a host name (compared case-insensitively).
    pub fn add_blocked_host(&mut self, host: impl Into<String>) {
        self.blocked_hosts.push(host.into());
    }

    /// Block an IP network given in CIDR notation.
    pub fn add_blocked_cidr(&mut self, cidr: &str) -> Result<()> {
        self.blocked_networks.push(cidr.parse()?);
        Ok(())
    }

    /// Validate a URL string against the policy.
    pub fn validate(&self, url: &str) -> Result<()> {
        if url.len() > MAX_URL_LENGTH {
            return Err(Error::validation(format!(
                "URL too long: max {MAX_URL_LENGTH} characters"
            )));
        }
        if url.contains(['\0', '\r', '\n']) {
            return Err(Error::validation("URL contains invalid characters"));
        }

        let scheme_end = url
            .find("://")
            .ok_or_else(|| Error::validation("invalid URL: missing scheme"))?;
        let scheme = &url[..scheme_end];
        if !self
            .allowed_schemes
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(scheme))
        {
            return Err(Error::validation(format!("unsupported scheme: {scheme}")));
        }

        let host = extract_host(&url[scheme_end + 3..]);
        self.check_host(host)?;

        // The URL parser accepts alternate IPv4 spellings (octal, hex, single
        // integer); check the host exactly as the transport will see it.
        if let Ok(parsed) = Url::parse(url) {
            match parsed.host() {
                Some(Host::Ipv4(ip)) => self.check_ip(IpAddr::V4(ip))?,
                Some(Host::Ipv6(ip)) => self.check_ip(IpAddr::V6(ip))?,
                Some(Host::Domain(domain)) => self.check_host(domain)?,
                None => {}
            }
        }

        Ok(())
    }

    /// Convenience wrapper: `true` when [`validate`](Self::validate) succeeds.
    pub fn is_safe_url(&self, url: &str) -> bool {
        self.validate(url).is_ok()
    }

    fn check_host(&self, host: &str) -> Result<()> {
        if let Some(blocked) = self
            .blocked_hosts
            .iter()
            .find(|blocked| blocked.eq_ignore_ascii_case(host))
        {
            return Err(Error::validation(format!(
                "access to host '{blocked}' is not allowed"
            )));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            self.check_ip(ip)?;
        }
        Ok(())
    }

    /// Check a single IP address against the network policy.
    ///
    /// Also used by the HTTP transport to re-check addresses obtained from DNS.
    pub fn check_ip(&self, ip: IpAddr) -> Result<()> {
        let ip = ip.to_canonical();

        if self.blocked_networks.iter().any(|net| net.contains(ip)) {
            return Err(Error::validation(format!(
                "access to IP {ip} is not allowed (private network)"
            )));
        }

        let loopback = ip.is_loopback();
        let link_local = is_link_local(ip);
        if !self.allow_private && (is_private(ip) || loopback || link_local) {
            return Err(Error::validation(format!(
                "access to IP {ip} is not allowed (private network)"
            )));
        }
        if !self.allow_loopback && loopback {
            return Err(Error::validation(format!(
                "access to loopback address {ip} is not allowed"
            )));
        }
        if !self.allow_link_local && link_local {
            return Err(Error::validation(format!(
                "access to link-local address {ip} is not allowed"
            )));
        }
        Ok(())
    }
}

/// Host part of the text following `scheme://`: userinfo, port and IPv6
/// brackets removed.
fn extract_host(rest: &str) -> &str {
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let host_port = match authority.rfind('@') {
        Some(at) => &authority[at + 1..],
        None => authority,
    };

    if let Some(stripped) = host_port.strip_prefix('[') {
        return match stripped.find(']') {
            Some(close) => &stripped[..close],
            None => stripped,
        };
    }

    match host_port.rfind(':') {
        Some(colon) => &host_port[..colon],
        None => host_port,
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
