//! SSH transport for the session pool, built on `ssh2`.
//!
//! `ssh2` is blocking, so every network operation runs on the blocking pool.

use async_trait::async_trait;
use ssh2::Session;
use std::io::Read;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ConnectError, ExecError, RemoteSession, SessionConnector, SessionKey};

/// Public key authentication against mesh nodes.
#[derive(Debug, Clone)]
pub struct SshConnector {
    user: String,
    private_key: PathBuf,
    timeout: Duration,
}

impl SshConnector {
    pub fn new(user: impl Into<String>, private_key: PathBuf, timeout: Duration) -> Self {
        Self {
            user: user.into(),
            private_key,
            timeout,
        }
    }

    fn connect_blocking(&self, key: &SessionKey) -> Result<SshSession, ConnectError> {
        let endpoint = key.to_string();
        let addr = socket_addr(key);

        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                ConnectError::Timeout {
                    endpoint: endpoint.clone(),
                }
            } else {
                ConnectError::Io {
                    endpoint: endpoint.clone(),
                    source: e,
                }
            }
        })?;

        let handshake_err = |e: ssh2::Error| ConnectError::Handshake {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        };

        let mut session = Session::new().map_err(handshake_err)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(handshake_err)?;

        session
            .userauth_pubkey_file(&self.user, None, &self.private_key, None)
            .map_err(|e| ConnectError::Auth {
                endpoint: endpoint.clone(),
                user: self.user.clone(),
                message: e.to_string(),
            })?;

        if !session.authenticated() {
            return Err(ConnectError::Auth {
                endpoint,
                user: self.user.clone(),
                message: "server did not accept the key".to_string(),
            });
        }

        debug!(endpoint = %endpoint, "SSH session authenticated");
        Ok(SshSession {
            endpoint,
            session: Arc::new(session),
        })
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, key: &SessionKey) -> Result<Box<dyn RemoteSession>, ConnectError> {
        let connector = self.clone();
        let key = key.clone();
        let endpoint = key.to_string();

        let session = tokio::task::spawn_blocking(move || connector.connect_blocking(&key))
            .await
            .map_err(|e| ConnectError::Handshake {
                endpoint,
                message: format!("Task join error: {}", e),
            })??;

        Ok(Box::new(session))
    }
}

pub struct SshSession {
    endpoint: String,
    session: Arc<Session>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<String, ExecError> {
        let session = self.session.clone();
        let endpoint = self.endpoint.clone();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || exec_blocking(&session, &endpoint, &command))
            .await
            .map_err(|e| ExecError::Connection {
                endpoint: self.endpoint.clone(),
                message: format!("Task join error: {}", e),
            })?
    }

    async fn close(&mut self) {
        let session = self.session.clone();
        let _ = tokio::task::spawn_blocking(move || {
            session.disconnect(None, "session pool closed", None)
        })
        .await;
    }
}

fn exec_blocking(session: &Session, endpoint: &str, command: &str) -> Result<String, ExecError> {
    let broken = |e: &dyn std::fmt::Display| ExecError::Connection {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    };

    let mut channel = session.channel_session().map_err(|e| broken(&e))?;
    channel.exec(command).map_err(|e| broken(&e))?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout).map_err(|e| broken(&e))?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| broken(&e))?;

    channel.wait_close().map_err(|e| broken(&e))?;
    let status = channel.exit_status().map_err(|e| broken(&e))?;

    if status != 0 {
        return Err(ExecError::Command {
            status,
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(stdout)
}

fn socket_addr(key: &SessionKey) -> SocketAddr {
    match key.address {
        IpAddr::V4(ip) => SocketAddr::V4(SocketAddrV4::new(ip, key.port)),
        IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(
            ip,
            key.port,
            0,
            scope_id(key.interface.as_deref()),
        )),
    }
}

#[cfg(unix)]
fn scope_id(interface: Option<&str>) -> u32 {
    interface
        .and_then(|name| nix::net::if_::if_nametoindex(name).ok())
        .unwrap_or(0)
}

#[cfg(not(unix))]
fn scope_id(_interface: Option<&str>) -> u32 {
    0
}
