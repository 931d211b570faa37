//! Global registry: one record per remote object, built from registry
//! announcements, from locally created proxies, or from both.
//!
//! New records are staged and only become visible to object managers after
//! the next round-trip barrier. By then the records for objects created from
//! this side have received both their server announcement and their bind
//! acknowledgement, in whichever order those arrived.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::core::{Core, WeakCore};
use crate::error::SessionError;
use crate::flags::{Features, GlobalClaims, Permissions};
use crate::local_object::LocalObject;
use crate::object::Object;
use crate::object_manager::{ObjectManager, WeakObjectManager};
use crate::object_type::ObjectType;
use crate::properties::Properties;
use crate::proxy::{Proxy, WeakProxy};

/// Id value of a record whose server-side object is gone.
pub const INVALID_ID: u32 = u32::MAX;

/// How a global refers to its proxy.
pub(crate) enum ProxySlot {
    /// Created for an announced global; the record keeps it alive.
    Owned(Proxy),
    /// Created by the user; the proxy keeps the record alive instead.
    Borrowed(WeakProxy),
}

impl ProxySlot {
    fn get(&self) -> Option<Proxy> {
        match self {
            ProxySlot::Owned(proxy) => Some(proxy.clone()),
            ProxySlot::Borrowed(weak) => weak.upgrade(),
        }
    }
}

struct GlobalRecord {
    id: u32,
    claims: GlobalClaims,
    object_type: ObjectType,
    interface: String,
    version: u32,
    permissions: Permissions,
    properties: Properties,
    proxy: Option<ProxySlot>,
    /// Set once the record is exposed in the table.
    registry: Option<WeakCore>,
}

impl GlobalRecord {
    fn merge(&mut self, spec: &GlobalSpec) {
        self.permissions = self.permissions.most_permissive(spec.permissions);
        self.claims |= spec.claim;
        if spec.object_type.is_a(self.object_type)
            && spec.object_type.depth() > self.object_type.depth()
        {
            self.object_type = spec.object_type;
        }
        if self.interface.is_empty() {
            self.interface = spec.interface.clone();
        }
        self.version = self.version.max(spec.version);
        self.properties.update(&spec.properties);
    }
}

/// Shared handle to one registry record.
#[derive(Clone)]
pub struct Global(Rc<RefCell<GlobalRecord>>);

impl Global {
    fn new(spec: &GlobalSpec) -> Self {
        Global(Rc::new(RefCell::new(GlobalRecord {
            id: spec.id,
            claims: spec.claim,
            object_type: spec.object_type,
            interface: spec.interface.clone(),
            version: spec.version,
            permissions: spec.permissions,
            properties: spec.properties.clone(),
            proxy: None,
            registry: None,
        })))
    }

    /// `None` once the server-side object has been removed.
    pub fn id(&self) -> Option<u32> {
        let id = self.0.borrow().id;
        (id != INVALID_ID).then_some(id)
    }

    pub fn claims(&self) -> GlobalClaims {
        self.0.borrow().claims
    }

    pub fn object_type(&self) -> ObjectType {
        self.0.borrow().object_type
    }

    pub fn interface(&self) -> String {
        self.0.borrow().interface.clone()
    }

    pub fn version(&self) -> u32 {
        self.0.borrow().version
    }

    pub fn permissions(&self) -> Permissions {
        self.0.borrow().permissions
    }

    pub fn properties(&self) -> Properties {
        self.0.borrow().properties.clone()
    }

    pub fn proxy(&self) -> Option<Proxy> {
        self.0.borrow().proxy.as_ref().and_then(ProxySlot::get)
    }

    pub fn is_exposed(&self) -> bool {
        self.0.borrow().registry.is_some()
    }

    pub fn ptr_eq(&self, other: &Global) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn set_owned_proxy(&self, proxy: Proxy) {
        self.0.borrow_mut().proxy = Some(ProxySlot::Owned(proxy));
    }

    fn take_proxy_slot(&self) -> Option<ProxySlot> {
        self.0.try_borrow_mut().ok().and_then(|mut rec| rec.proxy.take())
    }
}

impl fmt::Debug for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(rec) => f
                .debug_struct("Global")
                .field("id", &rec.id)
                .field("claims", &rec.claims)
                .field("object_type", &rec.object_type)
                .field("interface", &rec.interface)
                .field("permissions", &rec.permissions)
                .finish(),
            Err(_) => f.write_str("Global { <busy> }"),
        }
    }
}

/// Input to [`Registry::prepare`].
#[derive(Debug, Clone)]
pub struct GlobalSpec {
    pub id: u32,
    pub claim: GlobalClaims,
    pub object_type: ObjectType,
    pub interface: String,
    pub version: u32,
    pub permissions: Permissions,
    pub properties: Properties,
}

#[derive(Default)]
pub(crate) struct RegistryState {
    /// Exposed globals by id. Ids are sparse.
    globals: BTreeMap<u32, Global>,
    staged: Vec<Global>,
    objects: Vec<LocalObject>,
    managers: Vec<WeakObjectManager>,
}

impl RegistryState {
    /// Detach every proxy slot so the caller can drop them outside any borrow.
    pub(crate) fn teardown(&mut self) -> Vec<ProxySlot> {
        let globals = std::mem::take(&mut self.globals);
        let staged = std::mem::take(&mut self.staged);
        let slots = globals
            .values()
            .chain(staged.iter())
            .filter_map(Global::take_proxy_slot)
            .collect();
        self.objects.clear();
        self.managers.clear();
        slots
    }
}

/// Operations on the registry of one [`Core`].
pub struct Registry {
    core: Core,
}

impl Registry {
    pub(crate) fn new(core: Core) -> Self {
        Self { core }
    }

    fn state(&self) -> RefMut<'_, RegistryState> {
        self.core.0.registry.borrow_mut()
    }

    fn state_ref(&self) -> Ref<'_, RegistryState> {
        self.core.0.registry.borrow()
    }

    /// Find or create the staged record for `spec.id` and merge `spec` into it.
    ///
    /// When `proxy` is given it becomes the record's proxy; a record that
    /// already has a different live proxy is an invariant violation.
    pub fn prepare(&self, spec: GlobalSpec, proxy: Option<&Proxy>) -> Result<Global, SessionError> {
        let id = spec.id;
        let (global, created, first) = {
            let mut reg = self.state();
            match reg.staged.iter().find(|g| g.id() == Some(id)).cloned() {
                Some(global) => (global, false, false),
                None => {
                    let global = Global::new(&spec);
                    reg.staged.push(global.clone());
                    let first = reg.staged.len() == 1;
                    (global, true, first)
                }
            }
        };

        if first {
            self.core.sync(|core| core.registry().expose());
        }

        if created {
            trace!("staged new global {} ({}) claim {:?}", id, spec.object_type, spec.claim);
        } else {
            trace!("merging claim {:?} into staged global {}", spec.claim, id);
            global.0.borrow_mut().merge(&spec);
        }
        global
            .0
            .borrow_mut()
            .properties
            .set("object.id", id.to_string());

        if let Some(proxy) = proxy {
            let conflict = {
                let rec = global.0.borrow();
                rec.proxy
                    .as_ref()
                    .and_then(ProxySlot::get)
                    .is_some_and(|existing| !existing.ptr_eq(proxy))
            };
            if conflict {
                return Err(SessionError::Invariant(format!(
                    "global {id} already has a different proxy"
                )));
            }
            global.0.borrow_mut().proxy = Some(ProxySlot::Borrowed(proxy.downgrade()));
            proxy.set_global(Some(global.clone()));
        }

        Ok(global)
    }

    /// Move every staged record into the table and tell managers about them.
    pub fn expose(&self) {
        let staged = std::mem::take(&mut self.state().staged);
        debug!("exposing {} staged globals", staged.len());

        let mut exposed = Vec::with_capacity(staged.len());
        for global in staged {
            let Some(id) = global.id() else {
                trace!("dropping staged global that was removed before exposure");
                continue;
            };
            if global.claims().is_empty() {
                trace!("dropping unclaimed staged global {}", id);
                continue;
            }

            let previous = self.global_at(id);
            if let Some(previous) = previous {
                if previous.claims().contains(GlobalClaims::OWNED_BY_PROXY) {
                    self.remove_claim(&previous, GlobalClaims::OWNED_BY_PROXY);
                }
            }

            let displaced = {
                let mut reg = self.state();
                reg.globals.insert(id, global.clone())
            };
            if displaced.is_some() {
                warn!("global {} replaced a record the server never removed", id);
            }
            drop(displaced);

            global.0.borrow_mut().registry = Some(self.core.downgrade());
            exposed.push(global);
        }

        for manager in self.live_managers() {
            for global in &exposed {
                if global.id().is_some() && !global.claims().is_empty() {
                    manager.add_global(global);
                }
            }
            manager.maybe_objects_changed();
        }
    }

    /// Drop `claim` from `global`, releasing whatever the claim held.
    pub fn remove_claim(&self, global: &Global, claim: GlobalClaims) {
        for bit in [GlobalClaims::OWNED_BY_PROXY, GlobalClaims::APPEARS_ON_WIRE] {
            if claim.contains(bit) {
                self.remove_single_claim(global, bit);
            }
        }
    }

    fn remove_single_claim(&self, global: &Global, claim: GlobalClaims) {
        let (id, registered, slot) = {
            let mut rec = global.0.borrow_mut();
            if !rec.claims.contains(claim) {
                return;
            }
            rec.claims.remove(claim);
            (rec.id, rec.registry.is_some(), rec.proxy.take())
        };
        trace!("global {} lost claim {:?}", id, claim);

        let proxy = slot.as_ref().and_then(ProxySlot::get);
        if claim == GlobalClaims::APPEARS_ON_WIRE {
            if let Some(proxy) = &proxy {
                if registered {
                    self.notify_rm_object(&Object::Proxy(proxy.clone()));
                }
                proxy.deactivate(Features::BOUND);
                proxy.abort_activation("proxy removed from the registry");
            }
            let mut rec = global.0.borrow_mut();
            rec.id = INVALID_ID;
            rec.properties.remove("object.id");
        } else if registered {
            if let Some(proxy) = &proxy {
                self.notify_rm_object(&Object::Proxy(proxy.clone()));
            }
        }

        let released = !global.claims().contains(GlobalClaims::APPEARS_ON_WIRE);
        if registered && released && id != INVALID_ID {
            let old = {
                let mut reg = self.state();
                let current = reg.globals.get(&id).is_some_and(|g| g.ptr_eq(global));
                if current {
                    reg.globals.remove(&id)
                } else {
                    None
                }
            };
            drop(old);
        }

        if let Some(proxy) = &proxy {
            if proxy.global().is_some_and(|g| g.ptr_eq(global)) {
                proxy.set_global(None);
            }
        }
        drop(proxy);
        drop(slot);
    }

    /// The server withdrew global `id`.
    pub fn global_remove(&self, id: u32) {
        let global = {
            let reg = self.state_ref();
            reg.globals
                .get(&id)
                .cloned()
                .filter(|g| g.claims().contains(GlobalClaims::APPEARS_ON_WIRE))
                .or_else(|| {
                    reg.staged
                        .iter()
                        .find(|g| {
                            g.id() == Some(id)
                                && g.claims().contains(GlobalClaims::APPEARS_ON_WIRE)
                        })
                        .cloned()
                })
        };

        match global {
            Some(global) => {
                debug!("global removed: {} ({})", id, global.object_type());
                self.remove_claim(&global, GlobalClaims::APPEARS_ON_WIRE);
            }
            None => warn!("removal of unknown global {}", id),
        }
    }

    pub fn register_object(&self, object: LocalObject) {
        debug!("registering local object {}", object.name());
        self.state().objects.push(object.clone());
        let object = Object::Local(object);
        for manager in self.live_managers() {
            manager.add_object(&object);
            manager.maybe_objects_changed();
        }
    }

    pub fn remove_object(&self, object: &LocalObject) -> bool {
        let removed = {
            let mut reg = self.state();
            match reg.objects.iter().position(|o| o.ptr_eq(object)) {
                Some(index) => Some(reg.objects.remove(index)),
                None => None,
            }
        };
        let Some(removed) = removed else {
            return false;
        };
        debug!("removing local object {}", removed.name());
        self.notify_rm_object(&Object::Local(removed));
        true
    }

    pub fn install_object_manager(&self, manager: &ObjectManager) {
        manager.attach(&self.core);
        let (globals, objects) = {
            let mut reg = self.state();
            reg.managers.push(manager.downgrade());
            let globals: Vec<Global> = reg.globals.values().cloned().collect();
            (globals, reg.objects.clone())
        };
        debug!(
            "installing object manager over {} globals and {} local objects",
            globals.len(),
            objects.len()
        );

        for global in &globals {
            manager.add_global(global);
        }
        for object in objects {
            manager.add_object(&Object::Local(object));
        }
        manager.maybe_objects_changed();
    }

    pub fn has_staged(&self) -> bool {
        !self.state_ref().staged.is_empty()
    }

    pub fn global(&self, id: u32) -> Option<Global> {
        self.global_at(id)
    }

    pub fn globals(&self) -> Vec<Global> {
        self.state_ref().globals.values().cloned().collect()
    }

    /// Forget every global and local object.
    ///
    /// Pending round trips must already be discarded.
    pub(crate) fn clear(&self) {
        let managers = self.live_managers();
        for manager in &managers {
            manager.cancel_flush();
        }

        let (globals, staged, objects) = {
            let mut reg = self.state();
            (
                std::mem::take(&mut reg.globals),
                std::mem::take(&mut reg.staged),
                std::mem::take(&mut reg.objects),
            )
        };

        for object in objects {
            self.notify_rm_object(&Object::Local(object));
        }
        for global in globals.into_values() {
            self.remove_claim(&global, GlobalClaims::APPEARS_ON_WIRE);
        }
        let slots: Vec<ProxySlot> = staged.iter().filter_map(Global::take_proxy_slot).collect();
        drop(slots);

        for manager in &managers {
            manager.maybe_objects_changed();
        }
    }

    fn global_at(&self, id: u32) -> Option<Global> {
        self.state_ref().globals.get(&id).cloned()
    }

    fn notify_rm_object(&self, object: &Object) {
        for manager in self.live_managers() {
            manager.rm_object(object);
            manager.maybe_objects_changed();
        }
    }

    fn live_managers(&self) -> Vec<ObjectManager> {
        let mut reg = self.state();
        reg.managers.retain(|m| m.upgrade().is_some());
        reg.managers.iter().filter_map(WeakObjectManager::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::loopback::LoopbackRemote;
    use crate::type_registry::TypeRegistry;

    fn spec(id: u32, claim: GlobalClaims, object_type: ObjectType) -> GlobalSpec {
        GlobalSpec {
            id,
            claim,
            object_type,
            interface: "PipeWire:Interface:Node".to_string(),
            version: 3,
            permissions: Permissions::R,
            properties: Properties::new(),
        }
    }

    fn core() -> Core {
        Core::new(LoopbackRemote::new(), TypeRegistry::with_defaults())
    }

    #[test]
    fn test_prepare_merges_both_claims_into_one_record() {
        let core = core();
        let registry = core.registry();

        let mut wire = spec(4, GlobalClaims::APPEARS_ON_WIRE, ObjectType::GlobalProxy);
        wire.permissions = Permissions::R | Permissions::W;
        wire.properties.set("node.name", "sink");
        let a = registry.prepare(wire, None).unwrap();

        let mut local = spec(4, GlobalClaims::OWNED_BY_PROXY, ObjectType::Node);
        local.permissions = Permissions::R;
        let b = registry.prepare(local, None).unwrap();

        assert!(a.ptr_eq(&b));
        assert_eq!(a.claims(), GlobalClaims::all());
        assert_eq!(a.object_type(), ObjectType::Node);
        assert_eq!(a.permissions(), Permissions::R | Permissions::W);
        assert_eq!(a.properties().get("node.name"), Some("sink"));
        assert_eq!(a.properties().get("object.id"), Some("4"));
    }

    #[test]
    fn test_globals_are_staged_until_the_barrier() {
        let core = core();
        core.registry()
            .prepare(spec(2, GlobalClaims::APPEARS_ON_WIRE, ObjectType::Node), None)
            .unwrap();

        assert!(core.registry().has_staged());
        assert!(core.global(2).is_none());

        core.run_until_idle();

        assert!(!core.registry().has_staged());
        assert!(core.global(2).is_some_and(|g| g.is_exposed()));
    }

    #[test]
    fn test_removed_before_exposure_is_dropped() {
        let core = core();
        let registry = core.registry();
        registry
            .prepare(spec(9, GlobalClaims::APPEARS_ON_WIRE, ObjectType::Node), None)
            .unwrap();
        registry.global_remove(9);
        core.run_until_idle();

        assert!(core.global(9).is_none());
        assert!(core.globals().is_empty());
    }

    #[test]
    fn test_remove_then_readd_before_exposure_gets_a_fresh_record() {
        let core = core();
        let registry = core.registry();
        let first = registry
            .prepare(spec(3, GlobalClaims::APPEARS_ON_WIRE, ObjectType::Node), None)
            .unwrap();
        registry.global_remove(3);
        let second = registry
            .prepare(spec(3, GlobalClaims::APPEARS_ON_WIRE, ObjectType::Node), None)
            .unwrap();
        core.run_until_idle();

        assert!(!first.ptr_eq(&second));
        assert!(first.id().is_none());
        assert!(core.global(3).is_some_and(|g| g.ptr_eq(&second)));
    }

    #[test]
    fn test_table_is_sparse() {
        let core = core();
        let registry = core.registry();
        registry
            .prepare(spec(7, GlobalClaims::APPEARS_ON_WIRE, ObjectType::Node), None)
            .unwrap();
        core.run_until_idle();

        assert!(core.global(0).is_none());
        assert!(core.global(7).is_some());
        assert_eq!(core.globals().len(), 1);

        registry.global_remove(7);
        assert!(core.global(7).is_none());
    }

    #[test]
    fn test_remove_unknown_global_is_harmless() {
        let core = core();
        core.registry().global_remove(42);
        assert!(core.globals().is_empty());
    }
}
