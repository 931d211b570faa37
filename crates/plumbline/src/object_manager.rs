//! Object managers: filtered, live views over the registry.
//!
//! A manager holds interests. Once installed on a core it is offered every
//! exposed global and local object; for globals it creates proxies on
//! demand, activates the features its interests ask for, and only then
//! applies the full match. Changes are reported per object and, coalesced,
//! once per round trip through `ObjectsChanged`.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::core::{Core, SessionSettings, WeakCore};
use crate::error::SessionError;
use crate::flags::Features;
use crate::interest::{Constraint, Interest, MatchResult, MatchSubject};
use crate::object::Object;
use crate::object_type::ObjectType;
use crate::proxy::Proxy;
use crate::registry::Global;
use crate::signal::{HandlerId, Signal};

#[derive(Debug, Clone)]
pub enum ManagerEvent {
    ObjectAdded(Object),
    ObjectRemoved(Object),
    /// Coalesced notification; at most one per round trip.
    ObjectsChanged,
    /// The first full scan finished and every pending object settled.
    Installed,
}

#[derive(Default)]
struct ManagerState {
    interests: Vec<Interest>,
    features: Vec<(ObjectType, Features)>,
    objects: Vec<Object>,
    installed: bool,
    changed: bool,
    pending_objects: usize,
    flush_scheduled: bool,
}

#[derive(Default)]
struct ObjectManagerInner {
    core: RefCell<Option<WeakCore>>,
    state: RefCell<ManagerState>,
    events: Signal<ManagerEvent>,
}

#[derive(Clone, Default)]
pub struct ObjectManager(Rc<ObjectManagerInner>);

pub(crate) struct WeakObjectManager(Weak<ObjectManagerInner>);

impl WeakObjectManager {
    pub(crate) fn upgrade(&self) -> Option<ObjectManager> {
        self.0.upgrade().map(ObjectManager)
    }
}

enum Flush {
    Nothing,
    Schedule,
    Installed,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn downgrade(&self) -> WeakObjectManager {
        WeakObjectManager(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &ObjectManager) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn core(&self) -> Option<Core> {
        self.0.core.borrow().as_ref().and_then(WeakCore::upgrade)
    }

    pub(crate) fn attach(&self, core: &Core) {
        *self.0.core.borrow_mut() = Some(core.downgrade());
    }

    /// Match objects of `object_type` (or a subtype) that satisfy every
    /// constraint, activating `features` on them.
    pub fn add_interest(
        &self,
        object_type: ObjectType,
        constraints: Vec<Constraint>,
        features: Features,
    ) {
        self.add_interest_full(Interest {
            object_type,
            constraints,
            features,
        });
    }

    /// Malformed constraints are logged and dropped; the rest of the
    /// interest still applies.
    pub fn add_interest_full(&self, mut interest: Interest) {
        for error in interest.drop_invalid_constraints() {
            warn!("ignoring malformed constraint: {}", error);
        }
        trace!(
            "interest in {} with {} constraints",
            interest.object_type,
            interest.constraints.len()
        );
        self.0.state.borrow_mut().interests.push(interest);
    }

    /// Also activate `features` on every matched proxy of `object_type`.
    pub fn request_object_features(&self, object_type: ObjectType, features: Features) {
        let mut st = self.0.state.borrow_mut();
        match st.features.iter_mut().find(|(t, _)| *t == object_type) {
            Some((_, existing)) => *existing |= features,
            None => st.features.push((object_type, features)),
        }
    }

    pub fn connect(&self, handler: impl Fn(&ManagerEvent) + 'static) -> HandlerId {
        self.0.events.connect(handler)
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.0.events.disconnect(id)
    }

    pub fn is_installed(&self) -> bool {
        self.0.state.borrow().installed
    }

    pub fn n_objects(&self) -> usize {
        self.0.state.borrow().objects.len()
    }

    /// Snapshot of the matched objects.
    pub fn iterate(&self) -> impl Iterator<Item = Object> {
        self.0.state.borrow().objects.clone().into_iter()
    }

    /// Matched objects that also satisfy `interest`.
    pub fn iterate_filtered(&self, interest: &Interest) -> impl Iterator<Item = Object> {
        let mut interest = interest.clone();
        for error in interest.drop_invalid_constraints() {
            warn!("ignoring malformed constraint: {}", error);
        }
        self.iterate().filter(move |object| interest.matches(object))
    }

    pub fn lookup(&self, interest: &Interest) -> Option<Object> {
        self.iterate_filtered(interest).next()
    }

    /// Features to activate on `global`, or `None` if no interest wants it.
    fn wanted_features(&self, global: &Global, settings: &SessionSettings) -> Option<Features> {
        let object_type = global.object_type();
        let properties = global.properties();
        let subject = MatchSubject {
            object_type,
            global_properties: Some(&properties),
            properties: None,
            object: None,
        };

        let st = self.0.state.borrow();
        let mut interested = false;
        let mut needs_info = false;
        let mut wanted = Features::empty();
        for interest in &st.interests {
            let result = interest.matches_full(&subject);
            if result.contains(MatchResult::TYPE | MatchResult::GLOBAL_PROPERTIES) {
                interested = true;
                wanted |= interest.features;
                needs_info |= interest.has_property_constraints();
            }
        }
        if !interested {
            return None;
        }

        for (requested_type, features) in &st.features {
            if object_type.is_a(*requested_type) {
                wanted |= *features;
            }
        }
        if wanted.is_empty() {
            wanted = settings.default_features;
        }
        if needs_info && settings.force_info && object_type.has_info() {
            wanted |= Features::INFO;
        }
        Some(wanted)
    }

    pub(crate) fn add_global(&self, global: &Global) {
        if global.object_type() == ObjectType::GlobalProxy {
            return;
        }
        let Some(core) = self.core() else {
            return;
        };
        let Some(features) = self.wanted_features(global, core.settings()) else {
            return;
        };

        let proxy = match global.proxy() {
            Some(proxy) => proxy,
            None => {
                let Some(entry) = core
                    .types()
                    .lookup(&global.interface(), global.version())
                    .cloned()
                else {
                    debug!("no proxy type for {} v{}", global.interface(), global.version());
                    return;
                };
                let proxy = Proxy::for_global(&core, global, &entry);
                global.set_owned_proxy(proxy.clone());
                proxy
            }
        };

        self.0.state.borrow_mut().pending_objects += 1;
        trace!("activating {:?} on {}", features, proxy);

        let manager = self.downgrade();
        proxy.activate(features, move |proxy, result| {
            if let Some(manager) = manager.upgrade() {
                manager.on_proxy_ready(proxy, result);
            }
        });
    }

    fn on_proxy_ready(&self, proxy: &Proxy, result: Result<(), SessionError>) {
        {
            let mut st = self.0.state.borrow_mut();
            st.pending_objects = st.pending_objects.saturating_sub(1);
        }
        match result {
            Ok(()) => self.add_object(&Object::Proxy(proxy.clone())),
            Err(e) => debug!("{} not added: {}", proxy, e),
        }
        self.maybe_objects_changed();
    }

    pub(crate) fn add_object(&self, object: &Object) {
        let added = {
            let mut st = self.0.state.borrow_mut();
            if st.objects.iter().any(|o| o.ptr_eq(object)) {
                false
            } else if st.interests.iter().any(|i| i.matches(object)) {
                st.objects.push(object.clone());
                st.changed = true;
                true
            } else {
                false
            }
        };
        if added {
            trace!("added {}", object);
            self.0.events.emit(&ManagerEvent::ObjectAdded(object.clone()));
        }
    }

    pub(crate) fn rm_object(&self, object: &Object) {
        let removed = {
            let mut st = self.0.state.borrow_mut();
            match st.objects.iter().position(|o| o.ptr_eq(object)) {
                Some(index) => {
                    st.changed = true;
                    Some(st.objects.remove(index))
                }
                None => None,
            }
        };
        if let Some(removed) = removed {
            trace!("removed {}", removed);
            self.0.events.emit(&ManagerEvent::ObjectRemoved(removed));
        }
    }

    /// Report accumulated changes at the next round trip, or declare the
    /// manager installed once nothing is pending.
    pub(crate) fn maybe_objects_changed(&self) {
        let Some(core) = self.core() else {
            return;
        };
        let flush = {
            let mut st = self.0.state.borrow_mut();
            trace!(
                pending = st.pending_objects,
                changed = st.changed,
                installed = st.installed,
                "checking for changes"
            );
            if st.pending_objects > 0 {
                Flush::Nothing
            } else if st.changed {
                st.changed = false;
                if st.flush_scheduled {
                    Flush::Nothing
                } else {
                    st.flush_scheduled = true;
                    Flush::Schedule
                }
            } else if !st.installed && !st.flush_scheduled && !core.registry().has_staged() {
                st.installed = true;
                Flush::Installed
            } else {
                Flush::Nothing
            }
        };

        match flush {
            Flush::Schedule => {
                let manager = self.downgrade();
                core.sync(move |_| {
                    if let Some(manager) = manager.upgrade() {
                        manager.emit_objects_changed();
                    }
                });
            }
            Flush::Installed => {
                debug!("object manager installed, {} objects", self.n_objects());
                self.0.events.emit(&ManagerEvent::Installed);
            }
            Flush::Nothing => {}
        }
    }

    /// Forget a flush whose barrier was discarded; the changes it covered
    /// go out with the next one.
    pub(crate) fn cancel_flush(&self) {
        let mut st = self.0.state.borrow_mut();
        if st.flush_scheduled {
            st.flush_scheduled = false;
            st.changed = true;
        }
    }

    fn emit_objects_changed(&self) {
        let first_install = {
            let mut st = self.0.state.borrow_mut();
            st.flush_scheduled = false;
            let first = !st.installed;
            st.installed = true;
            first
        };
        if first_install {
            debug!("object manager installed, {} objects", self.n_objects());
            self.0.events.emit(&ManagerEvent::Installed);
        }
        trace!("objects changed");
        self.0.events.emit(&ManagerEvent::ObjectsChanged);
    }
}

impl fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.state.try_borrow() {
            Ok(st) => f
                .debug_struct("ObjectManager")
                .field("interests", &st.interests.len())
                .field("objects", &st.objects.len())
                .field("installed", &st.installed)
                .field("pending_objects", &st.pending_objects)
                .finish(),
            Err(_) => f.write_str("ObjectManager { <busy> }"),
        }
    }
}
