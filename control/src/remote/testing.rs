//! In-memory connector for tests: records every command and simulates
//! unreachable nodes, failing commands, broken sessions and latency.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::{ConnectError, ExecError, RemoteSession, SessionConnector, SessionKey};

#[derive(Default)]
struct FakeState {
    unreachable: HashSet<IpAddr>,
    failing: HashMap<String, i32>,
    breaking: HashSet<String>,
    broken_addresses: HashSet<IpAddr>,
    connects: usize,
    log: Vec<(SessionKey, String)>,
    in_flight: HashMap<SessionKey, usize>,
    total_in_flight: usize,
    max_in_flight_per_key: usize,
    max_in_flight: usize,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
    delay: Duration,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_unreachable(&self, ip: IpAddr) {
        self.state.lock().unreachable.insert(ip);
    }

    pub fn set_reachable(&self, ip: IpAddr) {
        self.state.lock().unreachable.remove(&ip);
    }

    /// Commands starting with `prefix` exit with `status`.
    pub fn fail_command(&self, prefix: &str, status: i32) {
        self.state.lock().failing.insert(prefix.to_string(), status);
    }

    /// Commands starting with `prefix` break the session.
    pub fn break_on(&self, prefix: &str) {
        self.state.lock().breaking.insert(prefix.to_string());
    }

    /// Every command sent to `ip` breaks the session.
    pub fn break_on_address(&self, ip: IpAddr) {
        self.state.lock().broken_addresses.insert(ip);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn commands(&self) -> Vec<(SessionKey, String)> {
        self.state.lock().log.clone()
    }

    pub fn commands_for(&self, ip: IpAddr) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(key, _)| key.address == ip)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn max_in_flight_per_key(&self) -> usize {
        self.state.lock().max_in_flight_per_key
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, key: &SessionKey) -> Result<Box<dyn RemoteSession>, ConnectError> {
        let mut state = self.state.lock();
        if state.unreachable.contains(&key.address) {
            return Err(ConnectError::Io {
                endpoint: key.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        state.connects += 1;

        Ok(Box::new(FakeSession {
            key: key.clone(),
            state: self.state.clone(),
            delay: self.delay,
        }))
    }
}

struct FakeSession {
    key: SessionKey,
    state: Arc<Mutex<FakeState>>,
    delay: Duration,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&mut self, command: &str) -> Result<String, ExecError> {
        {
            let mut state = self.state.lock();
            state.log.push((self.key.clone(), command.to_string()));

            let per_key = {
                let count = state.in_flight.entry(self.key.clone()).or_default();
                *count += 1;
                *count
            };
            state.total_in_flight += 1;
            state.max_in_flight_per_key = state.max_in_flight_per_key.max(per_key);
            state.max_in_flight = state.max_in_flight.max(state.total_in_flight);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(&self.key) {
            *count -= 1;
        }
        state.total_in_flight -= 1;

        if state.broken_addresses.contains(&self.key.address)
            || state.breaking.iter().any(|p| command.starts_with(p.as_str()))
        {
            return Err(ExecError::Connection {
                endpoint: self.key.to_string(),
                message: "connection reset by peer".to_string(),
            });
        }

        if let Some((_, status)) = state
            .failing
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return Err(ExecError::Command {
                status: *status,
                stderr: "uci: Entry not found".to_string(),
            });
        }

        let output = match command.strip_prefix("echo ") {
            Some(rest) => format!("{}\n", rest),
            None if command == "uptime" => " 12:00:00 up 3 days,  load average: 0.08\n".to_string(),
            None => String::new(),
        };
        Ok(output)
    }
}
