//! Maps remote interface names to object types and proxy behaviors.

use crate::flags::Features;
use crate::object_type::ObjectType;
use crate::pipewire_object::PipewireObject;
use crate::proxy::{BoundOnly, ProxyImpl};

/// Interface names announced by the media server.
pub mod interfaces {
    pub const NODE: &str = "PipeWire:Interface:Node";
    pub const PORT: &str = "PipeWire:Interface:Port";
    pub const LINK: &str = "PipeWire:Interface:Link";
    pub const DEVICE: &str = "PipeWire:Interface:Device";
    pub const CLIENT: &str = "PipeWire:Interface:Client";
    pub const MODULE: &str = "PipeWire:Interface:Module";
    pub const FACTORY: &str = "PipeWire:Interface:Factory";
    pub const METADATA: &str = "PipeWire:Interface:Metadata";
}

pub type ProxyConstructor = fn() -> Box<dyn ProxyImpl>;

#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub interface: String,
    /// Lowest interface version this entry can drive.
    pub min_version: u32,
    pub object_type: ObjectType,
    pub constructor: ProxyConstructor,
}

impl TypeEntry {
    pub fn new(
        interface: impl Into<String>,
        min_version: u32,
        object_type: ObjectType,
        constructor: ProxyConstructor,
    ) -> Self {
        Self {
            interface: interface.into(),
            min_version,
            object_type,
            constructor,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    entries: Vec<TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard media-server object kinds.
    pub fn with_defaults() -> Self {
        fn info_and_params() -> Box<dyn ProxyImpl> {
            Box::new(PipewireObject::new(
                Features::BOUND | Features::INFO | Features::PARAMS,
            ))
        }
        fn info_only() -> Box<dyn ProxyImpl> {
            Box::new(PipewireObject::new(Features::BOUND | Features::INFO))
        }
        fn bound_only() -> Box<dyn ProxyImpl> {
            Box::new(BoundOnly)
        }

        let mut types = Self::new();
        for (interface, object_type) in [
            (interfaces::NODE, ObjectType::Node),
            (interfaces::PORT, ObjectType::Port),
            (interfaces::DEVICE, ObjectType::Device),
        ] {
            types.register(TypeEntry::new(interface, 3, object_type, info_and_params));
        }
        for (interface, object_type) in [
            (interfaces::LINK, ObjectType::Link),
            (interfaces::CLIENT, ObjectType::Client),
            (interfaces::MODULE, ObjectType::Module),
            (interfaces::FACTORY, ObjectType::Factory),
        ] {
            types.register(TypeEntry::new(interface, 3, object_type, info_only));
        }
        types.register(TypeEntry::new(
            interfaces::METADATA,
            3,
            ObjectType::Metadata,
            bound_only,
        ));
        types
    }

    /// Add an entry, replacing one with the same interface and version.
    pub fn register(&mut self, entry: TypeEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.interface == entry.interface && e.min_version == entry.min_version)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Best entry for `interface` at `version`: the one with the highest
    /// minimum version the announced version still satisfies.
    pub fn lookup(&self, interface: &str, version: u32) -> Option<&TypeEntry> {
        self.entries
            .iter()
            .filter(|e| e.interface == interface && version >= e.min_version)
            .max_by_key(|e| e.min_version)
    }

    /// Newest entry for `interface`, regardless of version.
    pub fn lookup_interface(&self, interface: &str) -> Option<&TypeEntry> {
        self.entries
            .iter()
            .filter(|e| e.interface == interface)
            .max_by_key(|e| e.min_version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
