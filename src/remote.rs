//! Synchronous calls to other processes' objects.
//!
//! Every helper blocks the calling thread until the peer answers or the
//! connection fails; there is no timeout. Calling one from the thread that
//! serves incoming calls stalls that connection for the whole round-trip,
//! so handlers doing nested calls should be registered as asynchronous.

use std::collections::HashMap;

use tracing::{debug, trace};
use zbus::blocking::Connection;
use zbus::message::Message;
use zbus::zvariant::{OwnedValue, Value};

use crate::error::RemoteError;
use crate::message::interfaces;
use crate::object_server::ManagedObjects;

/// Call a method and wait for the reply.
///
/// Error replies come back from zbus as `MethodError` and are turned into
/// [`RemoteError::Remote`].
fn call<B>(
    conn: &Connection,
    service: &str,
    path: &str,
    interface: &str,
    method: &str,
    body: &B,
) -> Result<Message, RemoteError>
where
    B: serde::Serialize + zbus::zvariant::Type,
{
    trace!(service = %service, path = %path, interface = %interface, method = %method, "Calling remote method");
    let reply = conn
        .call_method(Some(service), path, Some(interface), method, body)
        .map_err(|e| {
            let err = RemoteError::from(e);
            debug!(error = %err, service = %service, path = %path, method = %method, "Remote call failed");
            err
        })?;
    Ok(reply)
}

/// Fetch every object `service` manages below `path`.
///
/// Calls `org.freedesktop.DBus.ObjectManager.GetManagedObjects`.
pub fn get_managed_objects(
    conn: &Connection,
    service: &str,
    path: &str,
) -> Result<ManagedObjects, RemoteError> {
    let reply = call(
        conn,
        service,
        path,
        interfaces::OBJECT_MANAGER,
        "GetManagedObjects",
        &(),
    )?;
    let objects: ManagedObjects = reply.body().deserialize()?;
    Ok(objects)
}

/// Read a property of a remote object.
pub fn get_property(
    conn: &Connection,
    service: &str,
    path: &str,
    interface: &str,
    property: &str,
) -> Result<OwnedValue, RemoteError> {
    let reply = call(
        conn,
        service,
        path,
        interfaces::PROPERTIES,
        "Get",
        &(interface, property),
    )?;
    let value: OwnedValue = reply.body().deserialize()?;
    Ok(value)
}

/// Write a property of a remote object.
pub fn set_property(
    conn: &Connection,
    service: &str,
    path: &str,
    interface: &str,
    property: &str,
    value: &Value<'_>,
) -> Result<(), RemoteError> {
    call(
        conn,
        service,
        path,
        interfaces::PROPERTIES,
        "Set",
        &(interface, property, value),
    )?;
    Ok(())
}

/// Broadcast `org.freedesktop.DBus.Properties.PropertiesChanged`.
///
/// The invalidated list is always empty. Success only means the local
/// connection accepted the signal.
pub fn emit_properties_changed(
    conn: &Connection,
    path: &str,
    interface: &str,
    changed: &HashMap<String, OwnedValue>,
) -> Result<(), RemoteError> {
    let invalidated: Vec<String> = Vec::new();
    let signal = Message::signal(path, interfaces::PROPERTIES, "PropertiesChanged")?
        .build(&(interface, changed, invalidated))?;
    conn.send(&signal).map_err(RemoteError::Transport)?;
    trace!(path = %path, interface = %interface, count = changed.len(), "Emitted PropertiesChanged");
    Ok(())
}
