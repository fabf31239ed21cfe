//! Port mapping codec
//!
//! Translates between the engines' port representations and the canonical
//! `{containerPort: hostPort}` map reported to the runner.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::domain::context::ContextPorts;
use crate::error::{HookError, Result};

/// Pattern of one line of `docker port <id>` output, e.g. `80/tcp -> 0.0.0.0:8080`
pub const PORT_LISTING_PATTERN: &str = r"^(\d+)(/\w+)? -> (.*):(\d+)$";

static PORT_LISTING: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(PORT_LISTING_PATTERN));

/// Transport protocol of a published port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// Upper-case name used by the cluster API
    pub fn as_k8s(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// A parsed published-port request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
    pub protocol: Protocol,
}

/// Parses `"<hostPort>[:<containerPort>][/tcp|udp]"`
///
/// A single number is the container port with no host binding, matching
/// how the engines treat `-p 80`.
pub fn parse_port_mapping(mapping: &str) -> Result<PortBinding> {
    const EXPECTED: &str = "\"<hostPort>[:<containerPort>][/tcp|udp]\"";
    let bad = || HookError::format(mapping, EXPECTED);

    let (ports, protocol) = match mapping.split_once('/') {
        Some((ports, proto)) => {
            let protocol = match proto.to_ascii_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                _ => return Err(bad()),
            };
            (ports, protocol)
        }
        None => (mapping, Protocol::Tcp),
    };

    let parse = |p: &str| -> Result<u16> {
        match p.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(bad()),
        }
    };

    let mut parts = ports.split(':');
    let binding = match (parts.next(), parts.next(), parts.next()) {
        (Some(container), None, None) => PortBinding {
            container_port: parse(container)?,
            host_port: None,
            protocol,
        },
        (Some(host), Some(container), None) => PortBinding {
            container_port: parse(container)?,
            host_port: Some(parse(host)?),
            protocol,
        },
        _ => return Err(bad()),
    };
    Ok(binding)
}

/// Parses every published-port request of a container
pub fn parse_port_mappings(mappings: &[String]) -> Result<Vec<PortBinding>> {
    mappings.iter().map(|m| parse_port_mapping(m)).collect()
}

/// Converts engine port listing lines into context ports
///
/// Every non-empty line must match [`PORT_LISTING_PATTERN`]; a single
/// mismatch fails the whole conversion.
pub fn context_ports_from_listing<S: AsRef<str>>(lines: &[S]) -> Result<ContextPorts> {
    let pattern = PORT_LISTING.as_ref().map_err(|e| {
        HookError::Configuration(format!("invalid port listing pattern: {}", e))
    })?;
    let mut ports = ContextPorts::new();
    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        let captures = pattern.captures(line).ok_or_else(|| {
            HookError::format(line, format!("a line matching \"{}\"", PORT_LISTING_PATTERN))
        })?;
        ports.insert(captures[1].to_string(), captures[4].to_string());
    }
    Ok(ports)
}

/// Converts declared `(containerPort, hostPort)` pairs into context ports
///
/// Pairs missing either side are skipped: a declared port is not
/// necessarily bound on the host.
pub fn context_ports_from_declared<I>(declared: I) -> ContextPorts
where
    I: IntoIterator<Item = (Option<i32>, Option<i32>)>,
{
    declared
        .into_iter()
        .filter_map(|pair| match pair {
            (Some(container), Some(host)) => Some((container.to_string(), host.to_string())),
            _ => None,
        })
        .collect()
}
