//! Anything an object manager can hold: a proxy or a local object.

use std::fmt;

use crate::flags::Features;
use crate::local_object::LocalObject;
use crate::object_type::ObjectType;
use crate::properties::Properties;
use crate::proxy::Proxy;

#[derive(Clone)]
pub enum Object {
    Proxy(Proxy),
    Local(LocalObject),
}

impl Object {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Object::Proxy(proxy) => proxy.object_type(),
            Object::Local(local) => local.object_type(),
        }
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        match (self, other) {
            (Object::Proxy(a), Object::Proxy(b)) => a.ptr_eq(b),
            (Object::Local(a), Object::Local(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Object::Proxy(proxy) => Some(proxy),
            Object::Local(_) => None,
        }
    }

    pub fn as_local(&self) -> Option<&LocalObject> {
        match self {
            Object::Local(local) => Some(local),
            Object::Proxy(_) => None,
        }
    }

    /// Registry properties. Local objects report their own properties.
    pub fn global_properties(&self) -> Option<Properties> {
        match self {
            Object::Proxy(proxy) => proxy.global_properties(),
            Object::Local(local) => Some(local.properties()),
        }
    }

    /// Info properties; a proxy only has them while `INFO` is active.
    pub fn properties(&self) -> Option<Properties> {
        match self {
            Object::Proxy(proxy) if proxy.active_features().contains(Features::INFO) => {
                proxy.info()
            }
            Object::Proxy(_) => None,
            Object::Local(local) => Some(local.properties()),
        }
    }

    /// Named attribute of the object itself, rendered as a string.
    pub fn field(&self, key: &str) -> Option<String> {
        match (self, key) {
            (_, "object-type") => Some(self.object_type().to_string()),
            (Object::Proxy(proxy), "bound-id") => proxy.bound_id().map(|id| id.to_string()),
            (Object::Proxy(proxy), "global-id") => proxy
                .global()
                .and_then(|g| g.id())
                .map(|id| id.to_string()),
            (Object::Proxy(proxy), "permissions") => {
                proxy.global().map(|g| g.permissions().to_string())
            }
            (Object::Proxy(proxy), "interface") => Some(proxy.interface().to_string()),
            (Object::Local(local), "name") => Some(local.name().to_string()),
            _ => None,
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl From<Proxy> for Object {
    fn from(proxy: Proxy) -> Self {
        Object::Proxy(proxy)
    }
}

impl From<LocalObject> for Object {
    fn from(local: LocalObject) -> Self {
        Object::Local(local)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Proxy(proxy) => write!(f, "{proxy}"),
            Object::Local(local) => write!(f, "{}<{}>", local.object_type(), local.name()),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Proxy(proxy) => f.debug_tuple("Proxy").field(proxy).finish(),
            Object::Local(local) => f.debug_tuple("Local").field(local).finish(),
        }
    }
}
