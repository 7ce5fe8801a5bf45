use std::time::Duration;

use crate::protocol::DriverError;

use super::{Config, Connection};

/// Default server port.
pub const DEFAULT_PORT: u16 = 28015;

/// Default handshake and connect timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Builder for opening a [`Connection`] with additional options.
pub struct ConnectionBuilder {
    host: String,
    port: u16,
    db: Option<String>,
    auth_key: String,
    timeout: Duration,
    reconnect_on_run: bool,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            db: None,
            auth_key: String::new(),
            timeout: DEFAULT_TIMEOUT,
            reconnect_on_run: false,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Default database injected into every query's global options.
    pub fn db(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    /// Key sent during the handshake.
    pub fn auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = key.into();
        self
    }

    /// Applies to connect, handshake reads and explicit wait timeouts.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reconnect automatically when `run` finds the connection closed.
    pub fn reconnect_on_run(mut self, reconnect: bool) -> Self {
        self.reconnect_on_run = reconnect;
        self
    }

    /// Open the connection: TCP connect, handshake, reader startup.
    pub async fn connect(self) -> Result<Connection, DriverError> {
        let conn = Connection::new(
            Config {
                host: self.host,
                port: self.port,
                auth_key: self.auth_key,
                timeout: self.timeout,
                reconnect_on_run: self.reconnect_on_run,
            },
            self.db,
        );
        conn.connect().await?;
        Ok(conn)
    }
}
