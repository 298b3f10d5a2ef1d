//! D-Bus message utilities.
//!
//! Helper functions for working with D-Bus messages.

use serde::Serialize;
use zbus::message::{Message, Type as MessageType};
use zbus::zvariant::Type;
use zbus::DBusError;

use crate::error::Result;

/// Well-known interface names of the standard D-Bus interfaces.
pub mod interfaces {
    pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
    pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
    pub const PEER: &str = "org.freedesktop.DBus.Peer";
}

/// Extension trait for working with D-Bus messages.
pub trait MessageExt {
    /// Get the sender of the message.
    fn sender_str(&self) -> Option<String>;

    /// Get the interface of the message.
    fn interface_str(&self) -> Option<String>;

    /// Get the member (method/signal name) of the message.
    fn member_str(&self) -> Option<String>;

    /// Get the path of the message.
    fn path_str(&self) -> Option<String>;

    /// Get the serial number of the message.
    fn serial(&self) -> u32;

    /// Check if this is a method call.
    fn is_method_call(&self) -> bool;

    /// Check if this is an error reply.
    fn is_error(&self) -> bool;

    /// Check if this is a signal.
    fn is_signal(&self) -> bool;

    /// Check if the caller asked for no reply.
    fn no_reply_expected(&self) -> bool;
}

impl MessageExt for Message {
    fn sender_str(&self) -> Option<String> {
        self.header().sender().map(|s| s.to_string())
    }

    fn interface_str(&self) -> Option<String> {
        self.header().interface().map(|i| i.to_string())
    }

    fn member_str(&self) -> Option<String> {
        self.header().member().map(|m| m.to_string())
    }

    fn path_str(&self) -> Option<String> {
        self.header().path().map(|p| p.to_string())
    }

    fn serial(&self) -> u32 {
        self.primary_header().serial_num().get()
    }

    fn is_method_call(&self) -> bool {
        self.primary_header().msg_type() == MessageType::MethodCall
    }

    fn is_error(&self) -> bool {
        self.primary_header().msg_type() == MessageType::Error
    }

    fn is_signal(&self) -> bool {
        self.primary_header().msg_type() == MessageType::Signal
    }

    fn no_reply_expected(&self) -> bool {
        self.primary_header()
            .flags()
            .contains(zbus::message::Flags::NoReplyExpected)
    }
}

/// Create a method return message from a request message.
pub fn create_method_return<B: Serialize + Type>(request: &Message, body: &B) -> Result<Message> {
    let reply = Message::method_return(&request.header())?.build(body)?;
    Ok(reply)
}

/// Create an error message from a request message.
pub fn create_error(request: &Message, error_name: &str, error_message: &str) -> Result<Message> {
    let reply = Message::error(&request.header(), error_name)?.build(&(error_message,))?;
    Ok(reply)
}

/// Create a broadcast signal message.
pub fn create_signal<B: Serialize + Type>(
    path: &str,
    interface: &str,
    member: &str,
    body: &B,
) -> Result<Message> {
    let signal = Message::signal(path, interface, member)?.build(body)?;
    Ok(signal)
}

/// Create an error message carrying a standard `org.freedesktop.DBus.Error.*`.
pub fn create_fdo_error(request: &Message, err: &zbus::fdo::Error) -> Result<Message> {
    create_error(
        request,
        err.name().as_str(),
        err.description().unwrap_or_default(),
    )
}

/// Common D-Bus error names.
pub mod error_names {
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const NO_MEMORY: &str = "org.freedesktop.DBus.Error.NoMemory";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}
