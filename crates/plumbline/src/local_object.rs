//! Objects that live only in this process (plugins, session items).
//!
//! They have no remote handle and no activation; registering one with the
//! core makes it visible to object managers immediately.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::object_type::ObjectType;
use crate::properties::Properties;

struct LocalObjectInner {
    name: String,
    object_type: ObjectType,
    properties: RefCell<Properties>,
}

#[derive(Clone)]
pub struct LocalObject(Rc<LocalObjectInner>);

impl LocalObject {
    pub fn new(object_type: ObjectType, name: impl Into<String>, properties: Properties) -> Self {
        LocalObject(Rc::new(LocalObjectInner {
            name: name.into(),
            object_type,
            properties: RefCell::new(properties),
        }))
    }

    pub fn plugin(name: impl Into<String>) -> Self {
        Self::new(ObjectType::Plugin, name, Properties::new())
    }

    pub fn session_item(name: impl Into<String>, properties: Properties) -> Self {
        Self::new(ObjectType::SessionItem, name, properties)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn object_type(&self) -> ObjectType {
        self.0.object_type
    }

    pub fn properties(&self) -> Properties {
        self.0.properties.borrow().clone()
    }

    /// Changes are not re-evaluated against installed interests.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.0.properties.borrow_mut().set(key, value);
    }

    pub fn ptr_eq(&self, other: &LocalObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalObject")
            .field("name", &self.0.name)
            .field("type", &self.0.object_type)
            .finish()
    }
}
