//! Session core: owns the registry, routes remote events, and provides the
//! round-trip synchronization barrier.
//!
//! Everything here runs on one thread. Events are processed strictly in the
//! order the remote delivered them.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

use plumbconf::SessionConfig;
use tracing::{debug, trace, warn};

use crate::flags::{Features, GlobalClaims, Permissions};
use crate::local_object::LocalObject;
use crate::object_manager::ObjectManager;
use crate::object_type::ObjectType;
use crate::proxy::{Proxy, WeakProxy};
use crate::registry::{Global, GlobalSpec, Registry, RegistryState, INVALID_ID};
use crate::remote::{NativeHandle, Remote, RemoteEvent};
use crate::type_registry::TypeRegistry;

type SyncCallback = Box<dyn FnOnce(&Core)>;

/// Defaults the core applies on behalf of callers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Activated on matches when nothing more specific was requested.
    pub default_features: Features,
    /// Add INFO when an interest filters on info properties.
    pub force_info: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            default_features: Features::from_names(&config.default_features),
            force_info: config.force_info_for_property_constraints,
        }
    }
}

pub(crate) struct CoreInner {
    remote: Rc<dyn Remote>,
    types: TypeRegistry,
    settings: SessionSettings,
    pub(crate) registry: RefCell<RegistryState>,
    routes: RefCell<HashMap<NativeHandle, WeakProxy>>,
    pending_syncs: RefCell<BTreeMap<u32, Vec<SyncCallback>>>,
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        // Globals and the proxies they own point at each other; cut the
        // links so both sides are freed.
        let slots = self.registry.get_mut().teardown();
        drop(slots);
    }
}

#[derive(Clone)]
pub struct Core(pub(crate) Rc<CoreInner>);

#[derive(Clone)]
pub struct WeakCore(Weak<CoreInner>);

impl WeakCore {
    pub fn upgrade(&self) -> Option<Core> {
        self.0.upgrade().map(Core)
    }
}

impl Core {
    pub fn new(remote: Rc<dyn Remote>, types: TypeRegistry) -> Self {
        Self::with_settings(remote, types, SessionSettings::default())
    }

    pub fn with_config(remote: Rc<dyn Remote>, types: TypeRegistry, config: &SessionConfig) -> Self {
        Self::with_settings(remote, types, SessionSettings::from(config))
    }

    pub fn with_settings(remote: Rc<dyn Remote>, types: TypeRegistry, settings: SessionSettings) -> Self {
        Core(Rc::new(CoreInner {
            remote,
            types,
            settings,
            registry: RefCell::new(RegistryState::default()),
            routes: RefCell::new(HashMap::new()),
            pending_syncs: RefCell::new(BTreeMap::new()),
        }))
    }

    pub fn downgrade(&self) -> WeakCore {
        WeakCore(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Core) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn remote(&self) -> Rc<dyn Remote> {
        self.0.remote.clone()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.0.types
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.0.settings
    }

    pub fn registry(&self) -> Registry {
        Registry::new(self.clone())
    }

    /// Run `callback` once every request issued so far has been answered.
    ///
    /// Returns the sequence number of the round trip.
    pub fn sync(&self, callback: impl FnOnce(&Core) + 'static) -> u32 {
        let seq = self.0.remote.sync();
        trace!("sync requested, seq {}", seq);
        self.0
            .pending_syncs
            .borrow_mut()
            .entry(seq)
            .or_default()
            .push(Box::new(callback));
        seq
    }

    pub fn handle_event(&self, event: RemoteEvent) {
        match event {
            RemoteEvent::Global {
                id,
                permissions,
                interface,
                version,
                properties,
            } => self.on_global(id, permissions, interface, version, properties),
            RemoteEvent::GlobalRemoved { id } => self.registry().global_remove(id),
            RemoteEvent::Done { seq } => self.on_done(seq),
            other => {
                let Some(handle) = other.handle() else {
                    return;
                };
                let proxy = self
                    .0
                    .routes
                    .borrow()
                    .get(&handle)
                    .and_then(WeakProxy::upgrade);
                match proxy {
                    Some(proxy) => proxy.handle_remote_event(other),
                    None => debug!("dropping event for unknown {}: {:?}", handle, other),
                }
            }
        }
    }

    /// Process one pending remote event. Returns false when none was queued.
    pub fn dispatch(&self) -> bool {
        match self.0.remote.poll_event() {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Process remote events until the queue is empty; returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        while self.dispatch() {
            processed += 1;
        }
        processed
    }

    fn on_global(
        &self,
        id: u32,
        permissions: Permissions,
        interface: String,
        version: u32,
        properties: crate::properties::Properties,
    ) {
        if id == INVALID_ID {
            warn!("ignoring {} announced with the reserved id {}", interface, id);
            return;
        }
        let object_type = match self.0.types.lookup(&interface, version) {
            Some(entry) => entry.object_type,
            None => {
                debug!(
                    "no wrapper registered for {} v{}; global {} stays bare",
                    interface, version, id
                );
                ObjectType::GlobalProxy
            }
        };

        let spec = GlobalSpec {
            id,
            claim: GlobalClaims::APPEARS_ON_WIRE,
            object_type,
            interface,
            version,
            permissions,
            properties,
        };
        if let Err(e) = self.registry().prepare(spec, None) {
            warn!("global {}: {}", id, e);
        }
    }

    fn on_done(&self, seq: u32) {
        let callbacks = self.0.pending_syncs.borrow_mut().remove(&seq);
        match callbacks {
            Some(callbacks) => {
                trace!("sync {} done, {} callbacks", seq, callbacks.len());
                for callback in callbacks {
                    callback(self);
                }
            }
            None => trace!("sync {} done, nobody waiting", seq),
        }
    }

    pub(crate) fn route(&self, handle: NativeHandle, proxy: &Proxy) {
        self.0.routes.borrow_mut().insert(handle, proxy.downgrade());
    }

    pub(crate) fn unroute(&self, handle: NativeHandle) {
        self.0.routes.borrow_mut().remove(&handle);
    }

    pub fn install_object_manager(&self, manager: &ObjectManager) {
        self.registry().install_object_manager(manager);
    }

    /// Register a local object; interested managers see it immediately.
    pub fn register_object(&self, object: LocalObject) {
        self.registry().register_object(object);
    }

    /// Returns false if the object was not registered.
    pub fn remove_object(&self, object: &LocalObject) -> bool {
        self.registry().remove_object(object)
    }

    /// The exposed global with `id`, if any.
    pub fn global(&self, id: u32) -> Option<Global> {
        self.registry().global(id)
    }

    /// Every exposed global, including bare ones with no wrapper type.
    pub fn globals(&self) -> Vec<Global> {
        self.registry().globals()
    }

    /// Drop every global and local object, reporting removals to managers.
    pub fn disconnect(&self) {
        debug!("disconnecting session core");
        self.0.pending_syncs.borrow_mut().clear();
        self.registry().clear();
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("settings", &self.0.settings)
            .field("types", &self.0.types.len())
            .finish()
    }
}
