//! Pooled remote management sessions.
//!
//! A [`SessionPool`] keeps at most one authenticated session per
//! [`SessionKey`] and runs one command at a time on it. The transport is
//! pluggable through [`SessionConnector`]; production uses [`SshConnector`].

mod error;
mod pool;
mod ssh;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;

pub use error::{ConnectError, ExecError, PoolError};
pub use pool::SessionPool;
pub use ssh::SshConnector;

/// Command used to check that a node accepts management sessions.
pub const REACHABILITY_COMMAND: &str = "uptime";

/// Identifies one pooled session: node address, port and the management
/// interface that scopes link-local addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub address: IpAddr,
    pub port: u16,
    pub interface: Option<String>,
}

impl SessionKey {
    pub fn new(address: IpAddr, port: u16, interface: Option<&str>) -> Self {
        Self {
            address,
            port,
            interface: interface.filter(|i| !i.is_empty()).map(str::to_string),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.address, &self.interface) {
            (IpAddr::V6(ip), Some(iface)) => write!(f, "[{}%{}]:{}", ip, iface, self.port),
            (IpAddr::V6(ip), None) => write!(f, "[{}]:{}", ip, self.port),
            (IpAddr::V4(ip), _) => write!(f, "{}:{}", ip, self.port),
        }
    }
}

/// One authenticated session. Never used by two commands at once.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a shell command and return its standard output.
    async fn exec(&mut self, command: &str) -> Result<String, ExecError>;

    async fn close(&mut self) {}
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, key: &SessionKey) -> Result<Box<dyn RemoteSession>, ConnectError>;
}
