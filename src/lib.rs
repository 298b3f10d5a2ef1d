//! dbus-dispatch - D-Bus method call dispatch for system daemons.
//!
//! This crate routes incoming D-Bus method calls to handlers through
//! declarative dispatch tables, exposes service objects as interface
//! skeletons without subclassing, and provides blocking helpers for
//! querying and changing other processes' objects.

pub mod bus_connection;
pub mod dispatch;
pub mod error;
pub mod interface;
pub mod invocation;
pub mod message;
pub mod object_server;
pub mod remote;
pub mod skeleton;

pub use bus_connection::BusConnection;
pub use dispatch::{dispatch_method_call, DispatchOutcome, DispatchRule};
pub use error::{DispatchError, Error, RemoteError, Result, SkeletonError};
pub use interface::InterfaceInfo;
pub use invocation::{MethodInvocation, ReplySink};
pub use object_server::{ManagedObjects, SkeletonServer};
pub use skeleton::{InterfaceSkeleton, Skeleton, SkeletonHandler};
