//! Pending method call handles.
//!
//! A [`MethodInvocation`] represents one incoming method call that still
//! needs an answer. Every reply method consumes the invocation, so a handler
//! can send at most one reply; dropping an invocation without replying logs
//! a warning and leaves the caller waiting for a timeout.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};
use zbus::message::Message;
use zbus::zvariant::Type;

use crate::error::Result;
use crate::message::{create_error, create_fdo_error, create_method_return, MessageExt};

/// Something replies can be sent through.
///
/// Implemented for [`zbus::blocking::Connection`]; tests substitute a sink
/// that records messages instead.
pub trait ReplySink: Send + Sync {
    /// Send a fully built reply message.
    fn send_reply(&self, reply: &Message) -> zbus::Result<()>;
}

impl ReplySink for zbus::blocking::Connection {
    fn send_reply(&self, reply: &Message) -> zbus::Result<()> {
        self.send(reply)
    }
}

/// Borrowed routing attributes of a method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInfo<'a> {
    /// Unique name of the caller.
    pub sender: Option<&'a str>,
    /// Object path the call was made on.
    pub path: Option<&'a str>,
    /// Interface the call was made on.
    pub interface: Option<&'a str>,
    /// Name of the called method.
    pub method: Option<&'a str>,
}

/// A single pending method call.
pub struct MethodInvocation {
    message: Message,
    sink: Arc<dyn ReplySink>,
    sender: Option<String>,
    path: Option<String>,
    interface: Option<String>,
    method: Option<String>,
    replied: bool,
}

impl MethodInvocation {
    /// Wrap an incoming method call message.
    pub fn new(message: Message, sink: Arc<dyn ReplySink>) -> Self {
        Self {
            sender: message.sender_str(),
            path: message.path_str(),
            interface: message.interface_str(),
            method: message.member_str(),
            message,
            sink,
            replied: false,
        }
    }

    /// The underlying method call message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Unique name of the caller.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Object path the call was made on.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Interface the call was made on.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Name of the called method.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Routing attributes used for dispatch rule matching.
    pub fn call_info(&self) -> CallInfo<'_> {
        CallInfo {
            sender: self.sender(),
            path: self.path(),
            interface: self.interface(),
            method: self.method(),
        }
    }

    /// Deserialize the call parameters.
    pub fn parameters<T>(&self) -> zbus::Result<T>
    where
        T: DeserializeOwned + Type,
    {
        self.message.body().deserialize()
    }

    /// Reply with a return value.
    ///
    /// A tuple body is sent as multiple out arguments.
    pub fn return_value<B>(mut self, body: &B) -> Result<()>
    where
        B: Serialize + Type,
    {
        let reply = create_method_return(&self.message, body)?;
        self.replied = true;
        self.send(reply)
    }

    /// Reply with no out arguments.
    pub fn return_empty(self) -> Result<()> {
        self.return_value(&())
    }

    /// Reply with a named D-Bus error.
    pub fn return_error(mut self, error_name: &str, error_message: &str) -> Result<()> {
        let reply = create_error(&self.message, error_name, error_message)?;
        self.replied = true;
        self.send(reply)
    }

    /// Reply with one of the standard `org.freedesktop.DBus.Error.*` errors.
    pub fn return_fdo_error(mut self, err: zbus::fdo::Error) -> Result<()> {
        let reply = create_fdo_error(&self.message, &err)?;
        self.replied = true;
        self.send(reply)
    }

    fn send(&self, reply: Message) -> Result<()> {
        if self.message.no_reply_expected() {
            trace!(method = ?self.method, "Caller expects no reply, dropping it");
            return Ok(());
        }
        if let Err(e) = self.sink.send_reply(&reply) {
            // The peer may have disconnected in the meantime.
            warn!(
                error = %e,
                sender = ?self.sender,
                method = ?self.method,
                "Couldn't send D-Bus method call reply"
            );
            return Err(e.into());
        }
        trace!(
            sender = ?self.sender,
            method = ?self.method,
            serial = self.message.serial(),
            "Sent method call reply"
        );
        Ok(())
    }
}

impl fmt::Debug for MethodInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInvocation")
            .field("sender", &self.sender)
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("method", &self.method)
            .field("serial", &self.message.serial())
            .finish()
    }
}

impl Drop for MethodInvocation {
    fn drop(&mut self) {
        if !self.replied {
            warn!(
                sender = ?self.sender,
                path = ?self.path,
                interface = ?self.interface,
                method = ?self.method,
                "D-Bus method call dropped without reply"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Reply sink that records every message sent through it.
    #[derive(Default)]
    pub struct RecordingSink {
        replies: Mutex<Vec<Message>>,
    }

    impl RecordingSink {
        pub fn replies(&self) -> Vec<Message> {
            self.replies.lock().unwrap().clone()
        }

        pub fn count(&self) -> usize {
            self.replies.lock().unwrap().len()
        }
    }

    impl ReplySink for RecordingSink {
        fn send_reply(&self, reply: &Message) -> zbus::Result<()> {
            self.replies.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    pub fn call(sender: &str, path: &str, interface: &str, method: &str) -> Message {
        Message::method_call(path, method)
            .unwrap()
            .interface(interface)
            .unwrap()
            .sender(sender)
            .unwrap()
            .build(&())
            .unwrap()
    }

    pub fn invocation(sink: &Arc<RecordingSink>, msg: Message) -> MethodInvocation {
        MethodInvocation::new(msg, sink.clone())
    }
}
