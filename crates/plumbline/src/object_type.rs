//! Runtime type tags for local objects and their subtype relation.

use std::fmt;
use std::str::FromStr;

/// Type of a local object.
///
/// Forms a single-inheritance tree rooted at `Object`; interests match a
/// candidate when its type is the interest's type or one of its subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Object,
    Proxy,
    /// A proxy for a registry global with no more specific wrapper.
    GlobalProxy,
    Node,
    Port,
    Link,
    Device,
    Client,
    Module,
    Factory,
    Metadata,
    Plugin,
    SessionItem,
}

impl ObjectType {
    pub const ALL: [ObjectType; 13] = [
        ObjectType::Object,
        ObjectType::Proxy,
        ObjectType::GlobalProxy,
        ObjectType::Node,
        ObjectType::Port,
        ObjectType::Link,
        ObjectType::Device,
        ObjectType::Client,
        ObjectType::Module,
        ObjectType::Factory,
        ObjectType::Metadata,
        ObjectType::Plugin,
        ObjectType::SessionItem,
    ];

    pub fn parent(&self) -> Option<ObjectType> {
        match self {
            ObjectType::Object => None,
            ObjectType::Proxy | ObjectType::Plugin | ObjectType::SessionItem => {
                Some(ObjectType::Object)
            }
            ObjectType::GlobalProxy => Some(ObjectType::Proxy),
            ObjectType::Node
            | ObjectType::Port
            | ObjectType::Link
            | ObjectType::Device
            | ObjectType::Client
            | ObjectType::Module
            | ObjectType::Factory
            | ObjectType::Metadata => Some(ObjectType::GlobalProxy),
        }
    }

    /// Distance from the root; deeper means more specific.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = *self;
        while let Some(parent) = current.parent() {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// True when `self` is `other` or one of its subtypes.
    pub fn is_a(&self, other: ObjectType) -> bool {
        let mut current = Some(*self);
        while let Some(t) = current {
            if t == other {
                return true;
            }
            current = t.parent();
        }
        false
    }

    /// Whether objects of this type carry an info property bag.
    pub fn has_info(&self) -> bool {
        matches!(
            self,
            ObjectType::Node
                | ObjectType::Port
                | ObjectType::Link
                | ObjectType::Device
                | ObjectType::Client
                | ObjectType::Module
                | ObjectType::Factory
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Object => "Object",
            ObjectType::Proxy => "Proxy",
            ObjectType::GlobalProxy => "GlobalProxy",
            ObjectType::Node => "Node",
            ObjectType::Port => "Port",
            ObjectType::Link => "Link",
            ObjectType::Device => "Device",
            ObjectType::Client => "Client",
            ObjectType::Module => "Module",
            ObjectType::Factory => "Factory",
            ObjectType::Metadata => "Metadata",
            ObjectType::Plugin => "Plugin",
            ObjectType::SessionItem => "SessionItem",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown object type: {}", s))
    }
}
