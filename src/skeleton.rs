//! Interface skeletons.
//!
//! An interface skeleton is the local object behind one exported interface
//! on one object path. The [`SkeletonServer`](crate::object_server::SkeletonServer)
//! talks to skeletons only through the [`Skeleton`] entry points; services
//! implement the smaller [`SkeletonHandler`] capability set and wrap it in
//! an [`InterfaceSkeleton`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error};
use zbus::fdo;
use zbus::zvariant::{OwnedValue, Value};

use crate::dispatch::{dispatch_method_call, DispatchOutcome, DispatchRule};
use crate::error::SkeletonError;
use crate::interface::InterfaceInfo;
use crate::invocation::MethodInvocation;
use crate::message::error_names;

/// Capabilities a service provides for one interface.
///
/// The implementing type doubles as the handler context: dispatch table
/// handlers receive `&Self`, and asynchronous handlers share it across
/// threads. Its `Drop` runs exactly once, when the last skeleton reference
/// goes away.
pub trait SkeletonHandler: Send + Sync + Sized + 'static {
    /// Rules routing incoming method calls to handlers.
    fn dispatch_table(&self) -> &'static [DispatchRule<Self>];

    /// Read a single property.
    fn get_property(&self, name: &str) -> fdo::Result<OwnedValue> {
        Err(fdo::Error::UnknownProperty(format!("Unknown property: {name}")))
    }

    /// Write a single property.
    fn set_property(&self, name: &str, _value: &Value<'_>) -> fdo::Result<()> {
        Err(fdo::Error::PropertyReadOnly(format!("Property is read-only: {name}")))
    }

    /// Read every readable property.
    fn properties(&self) -> fdo::Result<HashMap<String, OwnedValue>> {
        Ok(HashMap::new())
    }
}

/// Entry points the object server drives.
pub trait Skeleton: Send + Sync {
    /// Interface descriptor.
    fn info(&self) -> &'static InterfaceInfo;

    /// Handle an incoming method call.
    ///
    /// Returns the invocation untouched if nothing handled it, so the
    /// server can answer with its default error.
    fn method_call(&self, invocation: MethodInvocation) -> Option<MethodInvocation>;

    /// `org.freedesktop.DBus.Properties.Get`.
    fn get_property(&self, name: &str) -> fdo::Result<OwnedValue>;

    /// `org.freedesktop.DBus.Properties.Set`.
    fn set_property(&self, name: &str, value: &Value<'_>) -> fdo::Result<()>;

    /// `org.freedesktop.DBus.Properties.GetAll`.
    fn properties(&self) -> fdo::Result<HashMap<String, OwnedValue>>;
}

/// Adapter from a [`SkeletonHandler`] to the [`Skeleton`] entry points.
pub struct InterfaceSkeleton<H> {
    info: &'static InterfaceInfo,
    handler: Arc<H>,
}

impl<H: SkeletonHandler> InterfaceSkeleton<H> {
    /// Create a skeleton for `info` backed by `handler`.
    ///
    /// Fails if the descriptor does not name a valid interface; the handler
    /// is dropped in that case.
    pub fn new(info: &'static InterfaceInfo, handler: H) -> Result<Self, SkeletonError> {
        info.validate()?;
        Ok(Self {
            info,
            handler: Arc::new(handler),
        })
    }

    /// Create a skeleton sharing an existing handler.
    pub fn with_shared(
        info: &'static InterfaceInfo,
        handler: Arc<H>,
    ) -> Result<Self, SkeletonError> {
        info.validate()?;
        Ok(Self { info, handler })
    }

    /// The handler context.
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }
}

impl<H: SkeletonHandler> Skeleton for InterfaceSkeleton<H> {
    fn info(&self) -> &'static InterfaceInfo {
        self.info
    }

    fn method_call(&self, invocation: MethodInvocation) -> Option<MethodInvocation> {
        let rules = self.handler.dispatch_table();
        match dispatch_method_call(rules, invocation, &self.handler) {
            Ok(DispatchOutcome::Handled) => None,
            Ok(DispatchOutcome::Unhandled(invocation)) => {
                error!(
                    interface = ?invocation.interface(),
                    method = ?invocation.method(),
                    "Couldn't dispatch D-Bus method call"
                );
                Some(invocation)
            }
            Err(e) => {
                error!(error = %e, interface = self.info.name, "D-Bus method call dispatch failed");
                let invocation = e.into_invocation();
                if let Err(e) = invocation.return_error(
                    error_names::NO_MEMORY,
                    "Couldn't start method call handler",
                ) {
                    debug!(error = %e, "Couldn't report dispatch failure to caller");
                }
                None
            }
        }
    }

    fn get_property(&self, name: &str) -> fdo::Result<OwnedValue> {
        self.handler.get_property(name)
    }

    fn set_property(&self, name: &str, value: &Value<'_>) -> fdo::Result<()> {
        self.handler.set_property(name, value)
    }

    fn properties(&self) -> fdo::Result<HashMap<String, OwnedValue>> {
        self.handler.properties()
    }
}

impl<H> fmt::Debug for InterfaceSkeleton<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceSkeleton")
            .field("interface", &self.info.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use super::*;
    use crate::interface::{PropertyAccess, PropertyInfo};
    use crate::invocation::testing::{call, invocation, RecordingSink};
    use crate::message::MessageExt;

    static INFO: InterfaceInfo = InterfaceInfo {
        name: "org.example.Mixer1",
        methods: &[],
        properties: &[PropertyInfo {
            name: "Volume",
            signature: "u",
            access: PropertyAccess::ReadWrite,
        }],
        signals: &[],
    };

    struct Mixer {
        volume: AtomicU32,
        drops: Arc<AtomicUsize>,
    }

    impl Mixer {
        fn new(drops: &Arc<AtomicUsize>) -> Self {
            Self {
                volume: AtomicU32::new(50),
                drops: drops.clone(),
            }
        }
    }

    impl Drop for Mixer {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mute(inv: MethodInvocation, mixer: &Mixer) {
        mixer.volume.store(0, Ordering::SeqCst);
        inv.return_empty().unwrap();
    }

    static MIXER_RULES: &[DispatchRule<Mixer>] = &[
        DispatchRule::new(mute)
            .interface("org.example.Mixer1")
            .method("Mute"),
        DispatchRule::new(mute)
            .interface("org.example.Mixer1")
            .method("FadeOut")
            .asynchronous(),
    ];

    impl SkeletonHandler for Mixer {
        fn dispatch_table(&self) -> &'static [DispatchRule<Self>] {
            MIXER_RULES
        }

        fn get_property(&self, name: &str) -> fdo::Result<OwnedValue> {
            match name {
                "Volume" => Ok(OwnedValue::from(self.volume.load(Ordering::SeqCst))),
                _ => Err(fdo::Error::UnknownProperty(name.to_string())),
            }
        }

        fn set_property(&self, name: &str, value: &Value<'_>) -> fdo::Result<()> {
            match name {
                "Volume" => {
                    let volume = u32::try_from(value)
                        .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
                    self.volume.store(volume, Ordering::SeqCst);
                    Ok(())
                }
                _ => Err(fdo::Error::UnknownProperty(name.to_string())),
            }
        }

        fn properties(&self) -> fdo::Result<HashMap<String, OwnedValue>> {
            let mut props = HashMap::new();
            props.insert("Volume".to_string(), self.get_property("Volume")?);
            Ok(props)
        }
    }

    #[test]
    fn test_method_call_goes_through_dispatch_table() {
        let drops = Arc::new(AtomicUsize::new(0));
        let skeleton = InterfaceSkeleton::new(&INFO, Mixer::new(&drops)).unwrap();
        let sink = Arc::new(RecordingSink::default());

        let inv = invocation(&sink, call(":1.3", "/mixer", "org.example.Mixer1", "Mute"));
        assert!(skeleton.method_call(inv).is_none());
        assert_eq!(sink.count(), 1);
        assert_eq!(skeleton.handler().volume.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unhandled_call_is_returned() {
        let drops = Arc::new(AtomicUsize::new(0));
        let skeleton = InterfaceSkeleton::new(&INFO, Mixer::new(&drops)).unwrap();
        let sink = Arc::new(RecordingSink::default());

        let inv = invocation(&sink, call(":1.3", "/mixer", "org.example.Mixer1", "Boost"));
        let inv = skeleton.method_call(inv).expect("call should be unhandled");
        assert_eq!(sink.count(), 0);
        inv.return_error(error_names::UNKNOWN_METHOD, "Boost").unwrap();
        assert!(sink.replies()[0].is_error());
    }

    #[test]
    fn test_spawn_failure_replies_no_memory() {
        let drops = Arc::new(AtomicUsize::new(0));
        let skeleton = InterfaceSkeleton::new(&INFO, Mixer::new(&drops)).unwrap();
        let sink = Arc::new(RecordingSink::default());

        crate::dispatch::refuse_next_spawn();
        let inv = invocation(&sink, call(":1.3", "/mixer", "org.example.Mixer1", "FadeOut"));
        assert!(skeleton.method_call(inv).is_none());

        let replies = sink.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_error());
        assert_eq!(
            replies[0].header().error_name().map(|n| n.as_str()),
            Some(error_names::NO_MEMORY)
        );
        assert_eq!(skeleton.handler().volume.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_get_set_get_round_trip() {
        let drops = Arc::new(AtomicUsize::new(0));
        let skeleton = InterfaceSkeleton::new(&INFO, Mixer::new(&drops)).unwrap();

        let before = skeleton.get_property("Volume").unwrap();
        skeleton.set_property("Volume", &before).unwrap();
        let after = skeleton.get_property("Volume").unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_property_errors_pass_through() {
        let drops = Arc::new(AtomicUsize::new(0));
        let skeleton = InterfaceSkeleton::new(&INFO, Mixer::new(&drops)).unwrap();

        assert!(matches!(
            skeleton.get_property("Balance"),
            Err(fdo::Error::UnknownProperty(_))
        ));
        assert!(matches!(
            skeleton.set_property("Volume", &Value::from("loud")),
            Err(fdo::Error::InvalidArgs(_))
        ));
        let props = skeleton.properties().unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(skeleton.info().name, "org.example.Mixer1");
    }

    #[test]
    fn test_handler_dropped_once_with_skeleton() {
        let drops = Arc::new(AtomicUsize::new(0));
        let skeleton = InterfaceSkeleton::new(&INFO, Mixer::new(&drops)).unwrap();
        let shared: Arc<dyn Skeleton> = Arc::new(skeleton);
        let second = shared.clone();

        drop(shared);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_descriptor_drops_handler() {
        static BAD: InterfaceInfo = InterfaceInfo {
            name: "",
            methods: &[],
            properties: &[],
            signals: &[],
        };
        let drops = Arc::new(AtomicUsize::new(0));
        let result = InterfaceSkeleton::new(&BAD, Mixer::new(&drops));
        assert!(matches!(result, Err(SkeletonError::InvalidInterface(_))));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    struct Defaults;

    impl SkeletonHandler for Defaults {
        fn dispatch_table(&self) -> &'static [DispatchRule<Self>] {
            &[]
        }
    }

    #[test]
    fn test_default_capabilities() {
        let skeleton = InterfaceSkeleton::new(&INFO, Defaults).unwrap();
        assert!(matches!(
            skeleton.get_property("Volume"),
            Err(fdo::Error::UnknownProperty(_))
        ));
        assert!(matches!(
            skeleton.set_property("Volume", &Value::from(1u32)),
            Err(fdo::Error::PropertyReadOnly(_))
        ));
        assert!(skeleton.properties().unwrap().is_empty());
    }
}
