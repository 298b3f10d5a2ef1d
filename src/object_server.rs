//! Serving exported interface skeletons.
//!
//! The [`SkeletonServer`] reads method calls from a connection, one at a
//! time, and routes them to the [`Skeleton`] exported on the called object
//! path and interface. It answers the standard `Properties`,
//! `ObjectManager` and `Peer` interfaces itself and replies with the
//! standard `UnknownObject` / `UnknownInterface` / `UnknownMethod` errors
//! when no skeleton handles a call.
//!
//! Calls are checked against the skeleton's [`InterfaceInfo`](crate::interface::InterfaceInfo)
//! before the skeleton sees them: undeclared methods get `UnknownMethod`,
//! argument signatures must match the declared in arguments, and property
//! access and types must match the declared properties. `GetAll` and the
//! object manager only report readable properties.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};
use zbus::blocking::{Connection, MessageIterator};
use zbus::fdo;
use zbus::message::Message;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};

use crate::error::{Error, Result, SkeletonError};
use crate::interface::PropertyInfo;
use crate::invocation::{MethodInvocation, ReplySink};
use crate::message::{create_signal, error_names, interfaces, MessageExt};
use crate::skeleton::Skeleton;

/// Name given to the thread running [`SkeletonServer::spawn`].
const SERVER_THREAD_NAME: &str = "dbus-dispatch";

/// Objects and interfaces as returned by `GetManagedObjects`.
pub type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

type Interfaces = BTreeMap<String, Arc<dyn Skeleton>>;

/// Hosts interface skeletons on one connection.
pub struct SkeletonServer {
    connection: Connection,
    sink: Arc<dyn ReplySink>,
    /// Exported skeletons: object path -> interface name -> skeleton.
    objects: RwLock<HashMap<String, Interfaces>>,
    /// Path at which `InterfacesAdded`/`InterfacesRemoved` are emitted.
    object_manager: RwLock<Option<String>>,
}

impl SkeletonServer {
    /// Create a server for an established connection.
    pub fn new(connection: Connection) -> Self {
        Self {
            sink: Arc::new(connection.clone()),
            connection,
            objects: RwLock::new(HashMap::new()),
            object_manager: RwLock::new(None),
        }
    }

    /// The connection this server answers on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Announce exported objects below `path` through the object manager
    /// signals.
    pub fn set_object_manager(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        *self
            .object_manager
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(path.to_string());
        debug!(path = %path, "Object manager enabled");
        Ok(())
    }

    /// Export a skeleton on an object path.
    pub fn export<S: Skeleton + 'static>(&self, path: &str, skeleton: S) -> Result<()> {
        self.export_shared(path, Arc::new(skeleton))
    }

    /// Export a shared skeleton on an object path.
    pub fn export_shared(&self, path: &str, skeleton: Arc<dyn Skeleton>) -> Result<()> {
        validate_path(path)?;
        let interface = skeleton.info().name;
        {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            let interfaces = objects.entry(path.to_string()).or_default();
            if interfaces.contains_key(interface) {
                return Err(SkeletonError::AlreadyExported {
                    path: path.to_string(),
                    interface: interface.to_string(),
                }
                .into());
            }
            interfaces.insert(interface.to_string(), skeleton.clone());
        }
        info!(path = %path, interface = %interface, "Exported D-Bus interface");

        if let Some(manager) = self.manager_for(path) {
            let mut added = HashMap::new();
            added.insert(interface.to_string(), properties_or_empty(skeleton.as_ref()));
            let object = ObjectPath::try_from(path)
                .map_err(|e| SkeletonError::InvalidPath(format!("{path}: {e}")))?;
            let body = (object, added);
            self.emit(&manager, "InterfacesAdded", &body);
        }
        Ok(())
    }

    /// Remove an interface from an object path.
    ///
    /// Returns the removed skeleton. It is dropped, running the handler's
    /// destructor, once no in-flight call holds it any more.
    pub fn unexport(&self, path: &str, interface: &str) -> Option<Arc<dyn Skeleton>> {
        let removed = {
            let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
            let interfaces = objects.get_mut(path)?;
            let removed = interfaces.remove(interface)?;
            if interfaces.is_empty() {
                objects.remove(path);
            }
            removed
        };
        info!(path = %path, interface = %interface, "Unexported D-Bus interface");

        if let Some(manager) = self.manager_for(path) {
            match ObjectPath::try_from(path) {
                Ok(object) => {
                    let body = (object, vec![interface.to_string()]);
                    self.emit(&manager, "InterfacesRemoved", &body);
                }
                Err(e) => warn!(error = %e, path = %path, "Invalid path in registry"),
            }
        }
        Some(removed)
    }

    /// Number of exported interfaces across all paths.
    pub fn exported_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    /// Serve incoming calls on the current thread until the connection
    /// closes.
    pub fn run(&self) {
        self.serve(MessageIterator::from(&self.connection));
    }

    /// Serve incoming calls on a dedicated thread.
    ///
    /// The message stream is subscribed before this returns, so no call
    /// sent afterwards is missed.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let messages = MessageIterator::from(&self.connection);
        let server = Arc::clone(self);
        thread::Builder::new()
            .name(SERVER_THREAD_NAME.to_string())
            .spawn(move || server.serve(messages))
    }

    fn serve(&self, messages: MessageIterator) {
        info!(unique_name = ?self.connection.unique_name(), "Serving D-Bus objects");
        for msg in messages {
            match msg {
                Ok(msg) => self.handle_message(msg),
                Err(e) => warn!(error = %e, "Error receiving message"),
            }
        }
        info!("D-Bus connection closed");
    }

    /// Route one incoming message.
    ///
    /// Anything other than a method call is ignored.
    pub fn handle_message(&self, msg: Message) {
        if !msg.is_method_call() {
            return;
        }
        let invocation = MethodInvocation::new(msg, self.sink.clone());
        trace!(
            sender = ?invocation.sender(),
            path = ?invocation.path(),
            interface = ?invocation.interface(),
            method = ?invocation.method(),
            "Incoming method call"
        );

        let interface = invocation.interface().map(str::to_string);
        match interface.as_deref() {
            Some(interfaces::PROPERTIES) => self.handle_properties(invocation),
            Some(interfaces::OBJECT_MANAGER) => self.handle_object_manager(invocation),
            Some(interfaces::PEER) => handle_peer(invocation),
            _ => self.handle_call(invocation),
        }
    }

    fn handle_call(&self, invocation: MethodInvocation) {
        let skeletons = self.skeletons_at(invocation.path().unwrap_or_default());
        if skeletons.is_empty() {
            let path = invocation.path().unwrap_or_default().to_string();
            reply_error(invocation, error_names::UNKNOWN_OBJECT, &format!("Unknown object: {path}"));
            return;
        }

        let method = invocation.method().unwrap_or_default().to_string();
        let skeleton = match invocation.interface().map(str::to_string) {
            Some(name) => match skeletons.iter().find(|s| s.info().name == name) {
                Some(skeleton) => skeleton,
                None => {
                    reply_error(
                        invocation,
                        error_names::UNKNOWN_INTERFACE,
                        &format!("Unknown interface: {name}"),
                    );
                    return;
                }
            },
            // Calls without an interface go to the first interface declaring the method.
            None => match skeletons.iter().find(|s| s.info().method(&method).is_some()) {
                Some(skeleton) => skeleton,
                None => return reply_unknown_method(invocation),
            },
        };

        let Some(info) = skeleton.info().method(&method) else {
            return reply_unknown_method(invocation);
        };
        if !info.accepts(invocation.message().body().signature()) {
            let message = format!(
                "Type of message, '{}', does not match expected type '({})'",
                invocation.message().body().signature(),
                info.in_signature()
            );
            return reply_error(invocation, error_names::INVALID_ARGS, &message);
        }

        if let Some(unhandled) = skeleton.method_call(invocation) {
            reply_unknown_method(unhandled);
        }
    }

    fn handle_properties(&self, invocation: MethodInvocation) {
        let path = invocation.path().unwrap_or_default().to_string();
        let method = invocation.method().map(str::to_string);
        match method.as_deref() {
            Some("Get") => {
                let (interface, property): (String, String) = match invocation.parameters() {
                    Ok(args) => args,
                    Err(e) => return reply_invalid_args(invocation, e),
                };
                let result = self.find_skeleton(&path, &interface).and_then(|s| {
                    let info = property_info(s.as_ref(), &property)?;
                    if !info.access.readable() {
                        return Err(fdo::Error::InvalidArgs(format!(
                            "Property {interface}.{property} is not readable"
                        )));
                    }
                    s.get_property(&property)
                });
                match result {
                    Ok(value) => reply_value(invocation, &(value,)),
                    Err(e) => reply_fdo_error(invocation, e),
                }
            }
            Some("Set") => {
                let (interface, property, value): (String, String, OwnedValue) =
                    match invocation.parameters() {
                        Ok(args) => args,
                        Err(e) => return reply_invalid_args(invocation, e),
                    };
                let result = self.find_skeleton(&path, &interface).and_then(|s| {
                    let info = property_info(s.as_ref(), &property)?;
                    if !info.access.writable() {
                        return Err(fdo::Error::PropertyReadOnly(format!(
                            "Property {interface}.{property} is not writable"
                        )));
                    }
                    let signature = value.value_signature().to_string();
                    if signature != info.signature {
                        return Err(fdo::Error::InvalidArgs(format!(
                            "Property {interface}.{property} has type '{}', not '{signature}'",
                            info.signature
                        )));
                    }
                    s.set_property(&property, &value)
                });
                match result {
                    Ok(()) => reply_value(invocation, &()),
                    Err(e) => reply_fdo_error(invocation, e),
                }
            }
            Some("GetAll") => {
                let interface: String = match invocation.parameters() {
                    Ok(args) => args,
                    Err(e) => return reply_invalid_args(invocation, e),
                };
                let result = self
                    .find_skeleton(&path, &interface)
                    .and_then(|s| readable_properties(s.as_ref()));
                match result {
                    Ok(props) => reply_value(invocation, &(props,)),
                    Err(e) => reply_fdo_error(invocation, e),
                }
            }
            _ => reply_unknown_method(invocation),
        }
    }

    fn handle_object_manager(&self, invocation: MethodInvocation) {
        if invocation.method() != Some("GetManagedObjects") {
            return reply_unknown_method(invocation);
        }
        let root = invocation.path().unwrap_or("/").to_string();
        let is_manager = self
            .object_manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(root.as_str());
        if !is_manager {
            reply_error(
                invocation,
                error_names::UNKNOWN_OBJECT,
                &format!("No object manager at {root}"),
            );
            return;
        }
        match self.managed_objects(&root) {
            Ok(objects) => reply_value(invocation, &(objects,)),
            Err(e) => reply_error(invocation, error_names::FAILED, &e.to_string()),
        }
    }

    /// Every exported object strictly below `root`, with its properties.
    pub fn managed_objects(&self, root: &str) -> Result<ManagedObjects> {
        let snapshot: Vec<(String, Vec<Arc<dyn Skeleton>>)> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(path, _)| is_descendant(root, path))
            .map(|(path, interfaces)| (path.clone(), interfaces.values().cloned().collect()))
            .collect();

        let mut objects = ManagedObjects::new();
        for (path, skeletons) in snapshot {
            let interfaces = skeletons
                .iter()
                .map(|s| (s.info().name.to_string(), properties_or_empty(s.as_ref())))
                .collect();
            let object = ObjectPath::try_from(path.as_str())
                .map_err(|e| SkeletonError::InvalidPath(format!("{path}: {e}")))?;
            objects.insert(OwnedObjectPath::from(object), interfaces);
        }
        Ok(objects)
    }

    fn skeletons_at(&self, path: &str) -> Vec<Arc<dyn Skeleton>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|interfaces| interfaces.values().cloned().collect())
            .unwrap_or_default()
    }

    fn find_skeleton(&self, path: &str, interface: &str) -> fdo::Result<Arc<dyn Skeleton>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let interfaces = objects
            .get(path)
            .ok_or_else(|| fdo::Error::UnknownObject(format!("Unknown object: {path}")))?;
        interfaces
            .get(interface)
            .cloned()
            .ok_or_else(|| fdo::Error::UnknownInterface(format!("Unknown interface: {interface}")))
    }

    fn manager_for(&self, path: &str) -> Option<String> {
        self.object_manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|manager| is_descendant(manager, path))
            .cloned()
    }

    fn emit<B>(&self, manager: &str, member: &str, body: &B)
    where
        B: serde::Serialize + zbus::zvariant::Type,
    {
        let sent = create_signal(manager, interfaces::OBJECT_MANAGER, member, body)
            .and_then(|signal| self.connection.send(&signal).map_err(Error::from));
        if let Err(e) = sent {
            warn!(error = %e, signal = %member, "Couldn't emit object manager signal");
        }
    }
}

fn validate_path(path: &str) -> std::result::Result<(), SkeletonError> {
    ObjectPath::try_from(path)
        .map(|_| ())
        .map_err(|e| SkeletonError::InvalidPath(format!("{path}: {e}")))
}

/// Whether `path` lies strictly below `root` in the object tree.
fn is_descendant(root: &str, path: &str) -> bool {
    if root == "/" {
        return path != "/";
    }
    path.strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn property_info(skeleton: &dyn Skeleton, name: &str) -> fdo::Result<&'static PropertyInfo> {
    skeleton.info().property(name).ok_or_else(|| {
        fdo::Error::UnknownProperty(format!(
            "Unknown property: {}.{name}",
            skeleton.info().name
        ))
    })
}

/// The skeleton's properties that its descriptor marks readable.
fn readable_properties(skeleton: &dyn Skeleton) -> fdo::Result<HashMap<String, OwnedValue>> {
    let info = skeleton.info();
    let mut props = skeleton.properties()?;
    props.retain(|name, _| info.property(name).is_some_and(|p| p.access.readable()));
    Ok(props)
}

fn properties_or_empty(skeleton: &dyn Skeleton) -> HashMap<String, OwnedValue> {
    readable_properties(skeleton).unwrap_or_else(|e| {
        warn!(error = %e, interface = skeleton.info().name, "Couldn't read properties");
        HashMap::new()
    })
}

fn handle_peer(invocation: MethodInvocation) {
    if invocation.method() == Some("Ping") {
        reply_value(invocation, &());
    } else {
        reply_unknown_method(invocation);
    }
}

fn reply_value<B>(invocation: MethodInvocation, body: &B)
where
    B: serde::Serialize + zbus::zvariant::Type,
{
    if let Err(e) = invocation.return_value(body) {
        debug!(error = %e, "Reply not delivered");
    }
}

fn reply_error(invocation: MethodInvocation, name: &str, message: &str) {
    if let Err(e) = invocation.return_error(name, message) {
        debug!(error = %e, "Error reply not delivered");
    }
}

fn reply_fdo_error(invocation: MethodInvocation, err: fdo::Error) {
    if let Err(e) = invocation.return_fdo_error(err) {
        debug!(error = %e, "Error reply not delivered");
    }
}

fn reply_unknown_method(invocation: MethodInvocation) {
    let message = format!(
        "Unknown method: {}.{}",
        invocation.interface().unwrap_or_default(),
        invocation.method().unwrap_or_default()
    );
    reply_error(invocation, error_names::UNKNOWN_METHOD, &message);
}

fn reply_invalid_args(invocation: MethodInvocation, err: zbus::Error) {
    reply_error(invocation, error_names::INVALID_ARGS, &err.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("/", "/org"));
        assert!(!is_descendant("/", "/"));
        assert!(is_descendant("/org/audiod", "/org/audiod/hci0"));
        assert!(is_descendant("/org/audiod", "/org/audiod/hci0/dev/a2dp"));
        assert!(!is_descendant("/org/audiod", "/org/audiod"));
        assert!(!is_descendant("/org/audiod", "/org/audiod2"));
        assert!(!is_descendant("/org/audiod", "/org"));
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/org/example").is_ok());
        assert!(matches!(
            validate_path("org/example"),
            Err(SkeletonError::InvalidPath(_))
        ));
        assert!(validate_path("/org/example/").is_err());
    }
}
