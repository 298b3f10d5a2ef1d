//! Error types for dbus-dispatch.

use thiserror::Error;

use crate::invocation::MethodInvocation;

/// Result type alias for dbus-dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving or calling D-Bus objects.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// D-Bus error from zbus.
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// Method call dispatch error.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Remote call error.
    #[error("Remote call error: {0}")]
    Remote(#[from] RemoteError),

    /// Interface skeleton error.
    #[error("Skeleton error: {0}")]
    Skeleton(#[from] SkeletonError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Method call dispatch errors.
///
/// A call that matches no rule is not an error; see
/// [`DispatchOutcome::Unhandled`](crate::dispatch::DispatchOutcome::Unhandled).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The worker thread for an asynchronous handler could not be started.
    ///
    /// The invocation was never handed to the handler, so it is returned
    /// here and must still be answered.
    #[error("Couldn't create D-Bus call dispatcher: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
        invocation: MethodInvocation,
    },
}

impl DispatchError {
    /// Take back the unanswered invocation.
    pub fn into_invocation(self) -> MethodInvocation {
        match self {
            DispatchError::Spawn { invocation, .. } => invocation,
        }
    }
}

/// Errors from synchronous calls to another process's objects.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Sending the call or receiving the reply failed locally.
    #[error("Transport error: {0}")]
    Transport(zbus::Error),

    /// The peer answered with an error reply.
    #[error("{name}: {}", .message.as_deref().unwrap_or(""))]
    Remote {
        /// The D-Bus error name, e.g. `org.freedesktop.DBus.Error.InvalidArgs`.
        name: String,
        /// The optional human-readable error message.
        message: Option<String>,
    },

    /// The reply body did not have the expected signature.
    #[error("Failed to decode reply body: {0}")]
    Decode(String),
}

impl RemoteError {
    /// The remote error name, if the peer sent an error reply.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            RemoteError::Remote { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl From<zbus::Error> for RemoteError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, message, _) => RemoteError::Remote {
                name: name.to_string(),
                message,
            },
            zbus::Error::Variant(e) => RemoteError::Decode(e.to_string()),
            other => RemoteError::Transport(other),
        }
    }
}

impl From<zbus::zvariant::Error> for RemoteError {
    fn from(err: zbus::zvariant::Error) -> Self {
        RemoteError::Decode(err.to_string())
    }
}

/// Interface skeleton construction and export errors.
#[derive(Debug, Error)]
pub enum SkeletonError {
    /// The interface descriptor does not name a valid D-Bus interface.
    #[error("Invalid interface descriptor: {0}")]
    InvalidInterface(String),

    /// An argument or property signature is not a single complete type.
    #[error("Invalid signature in interface descriptor: {0}")]
    InvalidSignature(String),

    /// The object path is not a valid D-Bus object path.
    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    /// An interface with the same name is already exported on the path.
    #[error("Interface {interface} already exported on {path}")]
    AlreadyExported { path: String, interface: String },
}
