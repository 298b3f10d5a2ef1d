//! Static D-Bus interface descriptors.
//!
//! Descriptors are expected to live for the whole process, typically as
//! `static` items next to the dispatch table of the service implementing
//! the interface.

use std::str::FromStr;

use zbus::names::InterfaceName;
use zbus::zvariant::Signature;

use crate::error::SkeletonError;

/// Access mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }
}

/// A method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgInfo {
    pub name: &'static str,
    /// D-Bus type signature, e.g. `"a{sv}"`.
    pub signature: &'static str,
}

/// A method of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: &'static str,
    pub in_args: &'static [ArgInfo],
    pub out_args: &'static [ArgInfo],
}

impl MethodInfo {
    /// Concatenated signature of the in arguments.
    pub fn in_signature(&self) -> String {
        self.in_args.iter().map(|arg| arg.signature).collect()
    }

    /// Whether a call body with this signature fits the in arguments.
    pub fn accepts(&self, body: &Signature) -> bool {
        Signature::from_str(&self.in_signature()).is_ok_and(|expected| &expected == body)
    }
}

/// A property of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: &'static str,
    pub signature: &'static str,
    pub access: PropertyAccess,
}

/// A signal of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub name: &'static str,
    pub args: &'static [ArgInfo],
}

/// Shape of one D-Bus interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: &'static str,
    pub methods: &'static [MethodInfo],
    pub properties: &'static [PropertyInfo],
    pub signals: &'static [SignalInfo],
}

impl InterfaceInfo {
    /// Check that the descriptor names a valid D-Bus interface.
    ///
    /// Every argument and property signature must be a single complete
    /// type.
    pub fn validate(&self) -> Result<(), SkeletonError> {
        InterfaceName::try_from(self.name)
            .map_err(|e| SkeletonError::InvalidInterface(format!("{}: {}", self.name, e)))?;

        let args = self
            .methods
            .iter()
            .flat_map(|m| m.in_args.iter().chain(m.out_args))
            .chain(self.signals.iter().flat_map(|s| s.args))
            .map(|arg| (arg.name, arg.signature));
        let properties = self.properties.iter().map(|p| (p.name, p.signature));
        for (name, signature) in args.chain(properties) {
            if !is_single_type(signature) {
                return Err(SkeletonError::InvalidSignature(format!(
                    "{}: {name}: '{signature}'",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&'static MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&'static PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a signal by name.
    pub fn signal(&self, name: &str) -> Option<&'static SignalInfo> {
        self.signals.iter().find(|s| s.name == name)
    }
}

fn is_single_type(signature: &str) -> bool {
    !signature.is_empty()
        && Signature::from_str(signature).is_ok_and(|parsed| parsed.to_string() == signature)
}
