use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to reach {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("ssh handshake with {endpoint} failed: {message}")]
    Handshake { endpoint: String, message: String },

    #[error("authentication as {user} on {endpoint} rejected: {message}")]
    Auth {
        endpoint: String,
        user: String,
        message: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The session is unusable; the pool drops it.
    #[error("session to {endpoint} broke: {message}")]
    Connection { endpoint: String, message: String },

    /// The remote command ran and exited non-zero; the session stays pooled.
    #[error("command exited with status {status}: {stderr}")]
    Command { status: i32, stderr: String },
}

impl ExecError {
    pub fn is_connection_level(&self) -> bool {
        matches!(self, ExecError::Connection { .. })
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("session pool is closed")]
    Closed,

    #[error("no live session to {0}")]
    NotConnected(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl PoolError {
    /// True when no session is (any longer) available for the key.
    pub fn is_connection_level(&self) -> bool {
        match self {
            PoolError::Closed | PoolError::NotConnected(_) | PoolError::Connect(_) => true,
            PoolError::Exec(e) => e.is_connection_level(),
        }
    }
}
