//! Connection-string parsing.
//!
//! `scheme://host[:port][,host[:port]...][?opt=val&...]`. Option handling
//! is last-wins: a later occurrence of the same option overrides an
//! earlier one. Unknown values for enumerated options fail configuration;
//! unknown option names are logged and ignored.

use crate::error::{Error, ErrorKind, Result};

pub const DEFAULT_KV_PORT: u16 = 11210;
pub const DEFAULT_HTTP_PORT: u16 = 8091;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnSpec {
    pub scheme: String,
    pub hosts: Vec<(String, Option<u16>)>,
    /// Options in source order (duplicates preserved; consumers apply
    /// last-wins).
    pub options: Vec<(String, String)>,
}

impl ConnSpec {
    /// KV bootstrap addresses with the default port filled in.
    pub fn kv_addrs(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|(host, port)| format!("{host}:{}", port.unwrap_or(DEFAULT_KV_PORT)))
            .collect()
    }

    /// HTTP bootstrap addresses (management port unless one is given).
    pub fn http_addrs(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|(host, port)| match port {
                Some(port) => format!("{host}:{port}"),
                None => format!("{host}:{DEFAULT_HTTP_PORT}"),
            })
            .collect()
    }

    /// Last value for an option, if present.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub fn parse(raw: &str) -> Result<ConnSpec> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_context("empty connection string"));
    }

    let (scheme, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest),
        None => ("strata".to_string(), raw),
    };

    let (host_part, query) = match rest.split_once('?') {
        Some((hosts, query)) => (hosts, Some(query)),
        None => (rest, None),
    };

    let mut hosts = Vec::new();
    for entry in host_part.split(',') {
        let entry = entry.trim().trim_end_matches('/');
        if entry.is_empty() {
            continue;
        }
        match entry.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && !host.contains(':') => {
                let port: u16 = port.parse().map_err(|_| {
                    Error::new(ErrorKind::InvalidArgument)
                        .with_context(format!("invalid port in {entry:?}"))
                })?;
                hosts.push((host.to_string(), Some(port)));
            }
            _ => hosts.push((entry.to_string(), None)),
        }
    }
    if hosts.is_empty() {
        return Err(Error::new(ErrorKind::InvalidArgument)
            .with_context("connection string names no hosts"));
    }

    let mut options = Vec::new();
    if let Some(query) = query {
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::new(ErrorKind::InvalidArgument)
                    .with_context(format!("malformed option {pair:?}")));
            };
            options.push((key.to_string(), value.to_string()));
        }
    }

    Ok(ConnSpec {
        scheme,
        hosts,
        options,
    })
}

pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::new(ErrorKind::InvalidArgument)
            .with_context(format!("option {name} expects a boolean, got {other:?}"))),
    }
}

pub(crate) fn parse_millis(name: &str, value: &str) -> Result<std::time::Duration> {
    let ms: u64 = value.parse().map_err(|_| {
        Error::new(ErrorKind::InvalidArgument)
            .with_context(format!("option {name} expects milliseconds, got {value:?}"))
    })?;
    Ok(std::time::Duration::from_millis(ms))
}

pub(crate) fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| {
        Error::new(ErrorKind::InvalidArgument)
            .with_context(format!("option {name} expects an integer, got {value:?}"))
    })
}
