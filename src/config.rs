//! Server-list configuration for the two backend roles.
//!
//! The pool talks to two logical stores: one for values and one for tags
//! and locks. They may be the same physical cluster; an empty tag list
//! means "reuse the value servers".

use crate::error::{Error, Result};
use std::str::FromStr;

/// A single `host:port` endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheServer {
    pub host: String,
    pub port: u16,
}

impl CacheServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        CacheServer {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for CacheServer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::ConfigError(format!("malformed server address: {}", s)))?;
        if host.is_empty() {
            return Err(Error::ConfigError(format!("malformed server address: {}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::ConfigError(format!("bad port in server address: {}", s)))?;
        Ok(CacheServer::new(host, port))
    }
}

/// Endpoint lists for the value and tag roles.
#[derive(Clone, Debug, Default)]
pub struct PoolConfig {
    pub value_servers: Vec<CacheServer>,
    /// Servers for tag and lock records; empty means "use `value_servers`".
    pub tag_servers: Vec<CacheServer>,
}

impl PoolConfig {
    pub fn new(value_servers: Vec<CacheServer>, tag_servers: Vec<CacheServer>) -> Self {
        PoolConfig {
            value_servers,
            tag_servers,
        }
    }

    /// Effective server list for the tag role.
    pub fn tag_servers(&self) -> &[CacheServer] {
        if self.tag_servers.is_empty() {
            &self.value_servers
        } else {
            &self.tag_servers
        }
    }

    /// Fatal-at-construction validation of both roles.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` if the value server list is empty.
    pub fn validate(&self) -> Result<()> {
        if self.value_servers.is_empty() {
            return Err(Error::ConfigError("empty value server list".to_string()));
        }
        Ok(())
    }

    /// Even weight per server within a role, as an integer percentage.
    pub fn per_server_weight(count: usize) -> u32 {
        if count == 0 {
            0
        } else {
            (100 / count) as u32
        }
    }
}
