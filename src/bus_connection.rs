//! D-Bus connection setup using zbus.
//!
//! Connections are established asynchronously and then handed to the
//! dispatch layer as blocking handles, which share the same underlying
//! connection.

use std::os::unix::net::UnixStream;

use tracing::{debug, info};
use zbus::connection::Builder as ConnectionBuilder;
use zbus::Connection;

use crate::error::Result;

/// A connection to a D-Bus bus or peer.
#[derive(Debug, Clone)]
pub struct BusConnection {
    /// The underlying zbus connection.
    connection: Connection,
    /// Human-readable name for logging.
    name: String,
}

impl BusConnection {
    /// Connect to a D-Bus bus at the given address.
    ///
    /// # Arguments
    /// * `address` - The D-Bus address (e.g., "unix:path=/path/to/socket").
    /// * `name` - A human-readable name for logging.
    pub async fn connect(address: &str, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        info!(address = %address, name = %name, "Connecting to D-Bus");

        let connection = ConnectionBuilder::address(address)?.build().await?;

        debug!(
            name = %name,
            unique_name = ?connection.unique_name(),
            "Connected to D-Bus"
        );

        Ok(Self { connection, name })
    }

    /// Connect to the session bus.
    ///
    /// # Arguments
    /// * `address` - Optional override for the session bus address.
    ///   If None, uses DBUS_SESSION_BUS_ADDRESS env var.
    /// * `name` - A human-readable name for logging.
    pub async fn connect_session(address: Option<&str>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        let connection = if let Some(addr) = address {
            info!(address = %addr, name = %name, "Connecting to session bus at custom address");
            ConnectionBuilder::address(addr)?.build().await?
        } else {
            info!(name = %name, "Connecting to default session bus");
            Connection::session().await?
        };

        debug!(
            name = %name,
            unique_name = ?connection.unique_name(),
            "Connected to session bus"
        );

        Ok(Self { connection, name })
    }

    /// Connect to the system bus.
    pub async fn connect_system(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        info!(name = %name, "Connecting to system bus");

        let connection = Connection::system().await?;

        debug!(
            name = %name,
            unique_name = ?connection.unique_name(),
            "Connected to system bus"
        );

        Ok(Self { connection, name })
    }

    /// Create two connected peer-to-peer connections over a socket pair.
    ///
    /// Returns `(server, client)`. Useful for serving objects to a single
    /// in-process peer without a bus daemon.
    pub async fn pair(name: &str) -> Result<(Self, Self)> {
        let (server_stream, client_stream) = UnixStream::pair()?;
        let guid = zbus::Guid::generate();

        let (server, client) = futures::try_join!(
            ConnectionBuilder::unix_stream(server_stream)
                .server(guid)?
                .p2p()
                .build(),
            ConnectionBuilder::unix_stream(client_stream).p2p().build(),
        )?;

        debug!(name = %name, "Connected peer-to-peer pair");

        Ok((
            Self {
                connection: server,
                name: format!("{name}-server"),
            },
            Self {
                connection: client,
                name: format!("{name}-client"),
            },
        ))
    }

    /// Request ownership of a well-known name.
    pub async fn request_name(&self, well_known_name: &str) -> Result<()> {
        self.connection.request_name(well_known_name).await?;
        info!(bus = %self.name, name = %well_known_name, "Acquired well-known name");
        Ok(())
    }

    /// Get the connection's unique name on the bus.
    pub fn unique_name(&self) -> Option<&str> {
        self.connection.unique_name().map(|n| n.as_str())
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Get a blocking handle to the same connection.
    ///
    /// Dispatch, replies and the remote call helpers all use this handle.
    pub fn blocking(&self) -> zbus::blocking::Connection {
        zbus::blocking::Connection::from(self.connection.clone())
    }

    /// Get the human-readable name of this connection.
    pub fn name(&self) -> &str {
        &self.name
    }
}
