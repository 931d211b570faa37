//! Proxies: local handles to remote objects.
//!
//! A proxy owns at most one native handle and walks feature activation
//! through a [`Transition`]. The `BOUND` feature is granted when the server
//! acknowledges the bind; richer proxy kinds add their own steps through
//! [`ProxyImpl`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::core::{Core, WeakCore};
use crate::error::SessionError;
use crate::flags::{Features, GlobalClaims, Permissions};
use crate::object_type::ObjectType;
use crate::properties::Properties;
use crate::registry::{Global, GlobalSpec};
use crate::remote::{NativeHandle, RemoteEvent};
use crate::signal::{HandlerId, Signal};
use crate::transition::{Step, Transition, TransitionSteps, WeakTransition};
use crate::type_registry::TypeEntry;

/// Step that binds the proxy (or creates the object through a factory).
pub const STEP_BIND: Step = Step::Custom(1);

/// Per-kind behavior of a proxy.
pub trait ProxyImpl {
    fn supported_features(&self) -> Features {
        Features::BOUND
    }

    /// Choose the step that follows `step`, given what is still `missing`.
    fn next_step(&self, proxy: &Proxy, _step: Step, _missing: Features) -> Step {
        bind_next_step(proxy)
    }

    fn execute_step(&self, proxy: &Proxy, transition: &Transition, step: Step, _missing: Features) {
        execute_base_step(proxy, transition, step);
    }

    /// Called before `features` are retracted by [`Proxy::deactivate`].
    fn deactivate(&self, _proxy: &Proxy, _features: Features) {}
}

/// Every other feature needs the native handle, so binding always comes first.
pub fn bind_next_step(proxy: &Proxy) -> Step {
    if proxy.active_features().contains(Features::BOUND) {
        Step::Error
    } else {
        STEP_BIND
    }
}

/// Steps every proxy understands.
pub fn execute_base_step(proxy: &Proxy, transition: &Transition, step: Step) {
    match step {
        s if s == STEP_BIND => proxy.step_bind(transition),
        Step::Error => {}
        other => transition.return_error(SessionError::Invariant(format!(
            "{proxy}: unhandled activation step {other}"
        ))),
    }
}

/// A proxy that supports nothing beyond `BOUND`.
#[derive(Debug, Default)]
pub struct BoundOnly;

impl ProxyImpl for BoundOnly {}

#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Bound(u32),
    Destroyed,
    Error(SessionError),
    InfoChanged,
    FeaturesChanged(Features),
}

pub type ActivateCallback = Box<dyn FnOnce(&Proxy, Result<(), SessionError>)>;
type Waiters = Rc<RefCell<Vec<ActivateCallback>>>;

struct PendingActivation {
    transition: Transition,
    requested: Features,
    waiters: Waiters,
}

#[derive(Debug, Clone)]
struct FactoryRequest {
    name: String,
    properties: Properties,
}

#[derive(Default)]
struct ProxyState {
    handle: Option<NativeHandle>,
    bound_id: Option<u32>,
    global: Option<Global>,
    features: Features,
    info: Option<Properties>,
    params: Vec<(u32, serde_json::Value)>,
    pending: VecDeque<PendingActivation>,
    /// Activation waiting on the server's answer to a bind.
    bind_watch: Option<WeakTransition>,
}

struct ProxyInner {
    core: WeakCore,
    object_type: ObjectType,
    interface: String,
    version: u32,
    factory: Option<FactoryRequest>,
    behavior: Box<dyn ProxyImpl>,
    state: RefCell<ProxyState>,
    events: Signal<ProxyEvent>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let handle = state.handle.take();
        let global = state.global.take();
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if let Some(handle) = handle {
            core.unroute(handle);
            core.remote().destroy(handle);
        }
        if let Some(global) = global {
            if global.claims().contains(GlobalClaims::OWNED_BY_PROXY) {
                core.registry().remove_claim(&global, GlobalClaims::OWNED_BY_PROXY);
            }
        }
    }
}

#[derive(Clone)]
pub struct Proxy(Rc<ProxyInner>);

#[derive(Clone)]
pub struct WeakProxy(Weak<ProxyInner>);

impl WeakProxy {
    pub fn upgrade(&self) -> Option<Proxy> {
        self.0.upgrade().map(Proxy)
    }
}

impl Proxy {
    fn build(
        core: &Core,
        object_type: ObjectType,
        interface: String,
        version: u32,
        factory: Option<FactoryRequest>,
        behavior: Box<dyn ProxyImpl>,
    ) -> Self {
        Proxy(Rc::new(ProxyInner {
            core: core.downgrade(),
            object_type,
            interface,
            version,
            factory,
            behavior,
            state: RefCell::new(ProxyState::default()),
            events: Signal::new(),
        }))
    }

    /// Wrap an announced global.
    pub(crate) fn for_global(core: &Core, global: &Global, entry: &TypeEntry) -> Self {
        let proxy = Self::build(
            core,
            entry.object_type,
            global.interface(),
            global.version(),
            None,
            (entry.constructor)(),
        );
        proxy.set_global(Some(global.clone()));
        proxy
    }

    /// A proxy whose activation asks `factory` to create a new object.
    ///
    /// The object's registry record appears once the server acknowledges
    /// the creation and announces the object.
    pub fn from_factory(
        core: &Core,
        factory: &str,
        interface: &str,
        properties: Properties,
    ) -> Result<Self, SessionError> {
        let Some(entry) = core.types().lookup_interface(interface) else {
            return Err(SessionError::InvalidArgument(format!(
                "no proxy type registered for {interface}"
            )));
        };
        Ok(Self::build(
            core,
            entry.object_type,
            interface.to_string(),
            entry.min_version,
            Some(FactoryRequest {
                name: factory.to_string(),
                properties,
            }),
            (entry.constructor)(),
        ))
    }

    pub fn downgrade(&self) -> WeakProxy {
        WeakProxy(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Proxy) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn core(&self) -> Option<Core> {
        self.0.core.upgrade()
    }

    pub fn object_type(&self) -> ObjectType {
        self.0.object_type
    }

    pub fn interface(&self) -> &str {
        &self.0.interface
    }

    pub fn handle(&self) -> Option<NativeHandle> {
        self.0.state.borrow().handle
    }

    /// Server id, known once `BOUND` has been granted.
    pub fn bound_id(&self) -> Option<u32> {
        self.0.state.borrow().bound_id
    }

    pub fn global(&self) -> Option<Global> {
        self.0.state.borrow().global.clone()
    }

    pub fn global_properties(&self) -> Option<Properties> {
        self.global().map(|g| g.properties())
    }

    /// Info properties as last reported by the server.
    pub fn info(&self) -> Option<Properties> {
        self.0.state.borrow().info.clone()
    }

    /// Cached parameters; filled while `PARAMS` is active.
    pub fn params(&self) -> Vec<(u32, serde_json::Value)> {
        self.0.state.borrow().params.clone()
    }

    pub fn active_features(&self) -> Features {
        self.0.state.borrow().features
    }

    pub fn supported_features(&self) -> Features {
        self.0.behavior.supported_features()
    }

    pub fn connect(&self, handler: impl Fn(&ProxyEvent) + 'static) -> HandlerId {
        self.0.events.connect(handler)
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.0.events.disconnect(id)
    }

    fn missing_features(&self, requested: Features) -> Features {
        requested
            .intersection(self.supported_features())
            .difference(self.active_features())
    }

    /// Activate `features`; `callback` runs once they are active or the
    /// activation failed.
    ///
    /// Requests for features an in-flight activation already covers join
    /// that activation instead of starting another.
    pub fn activate(
        &self,
        features: Features,
        callback: impl FnOnce(&Proxy, Result<(), SessionError>) + 'static,
    ) {
        let missing = self.missing_features(features);
        if missing.is_empty() {
            trace!("{}: {:?} already active", self, features);
            callback(self, Ok(()));
            return;
        }

        {
            let st = self.0.state.borrow();
            if let Some(pending) = st.pending.iter().find(|p| p.requested.contains(missing)) {
                trace!("{}: joining in-flight activation of {:?}", self, pending.requested);
                pending.waiters.borrow_mut().push(Box::new(callback));
                return;
            }
        }

        let waiters: Waiters = Rc::new(RefCell::new(vec![Box::new(callback) as ActivateCallback]));
        let label = format!("activate {self}");
        let proxy = self.clone();
        let done = waiters.clone();
        let transition = Transition::new(
            label,
            ActivationSteps {
                proxy: self.clone(),
            },
            move |transition| proxy.activation_completed(transition, &done),
        );
        transition.set_data(features);

        let start = {
            let mut st = self.0.state.borrow_mut();
            st.pending.push_back(PendingActivation {
                transition: transition.clone(),
                requested: features,
                waiters,
            });
            st.pending.len() == 1
        };
        debug!("{}: activating {:?}", self, missing);
        if start {
            transition.advance();
        }
    }

    /// [`activate`](Self::activate) as a future.
    pub fn activate_future(
        &self,
        features: Features,
    ) -> impl Future<Output = Result<(), SessionError>> {
        let (tx, rx) = oneshot::channel();
        self.activate(features, move |_, result| {
            let _ = tx.send(result);
        });
        async move {
            rx.await.unwrap_or_else(|_| {
                Err(SessionError::Aborted(
                    "activation dropped before completion".to_string(),
                ))
            })
        }
    }

    fn activation_completed(&self, transition: &Transition, waiters: &Waiters) {
        let result = transition.finish();
        let finished = {
            let mut st = self.0.state.borrow_mut();
            let index = st.pending.iter().position(|p| p.transition.ptr_eq(transition));
            index.and_then(|index| st.pending.remove(index))
        };
        drop(finished);

        match &result {
            Ok(()) => debug!("{}: active features now {:?}", self, self.active_features()),
            Err(e) => debug!("{}: activation failed: {}", self, e),
        }

        let callbacks = std::mem::take(&mut *waiters.borrow_mut());
        for callback in callbacks {
            callback(self, result.clone());
        }

        self.advance_activations();
    }

    fn advance_activations(&self) {
        let front = self
            .0
            .state
            .borrow()
            .pending
            .front()
            .map(|p| p.transition.clone());
        if let Some(transition) = front {
            transition.advance();
        }
    }

    /// Fail every queued activation with `reason`.
    pub fn abort_activation(&self, reason: &str) {
        let pending = std::mem::take(&mut self.0.state.borrow_mut().pending);
        if !pending.is_empty() {
            debug!("{}: aborting {} activations: {}", self, pending.len(), reason);
        }
        for activation in pending {
            if !activation.transition.completed() {
                activation
                    .transition
                    .return_error(SessionError::Aborted(reason.to_string()));
            }
        }
    }

    /// Record features granted or withdrawn outside a step, then let the
    /// current activation re-evaluate.
    pub fn update_features(&self, activated: Features, deactivated: Features) {
        let (old, new) = {
            let mut st = self.0.state.borrow_mut();
            let old = st.features;
            st.features = old.union(activated).difference(deactivated);
            (old, st.features)
        };
        if old != new {
            trace!("{}: features {:?} -> {:?}", self, old, new);
            self.0.events.emit(&ProxyEvent::FeaturesChanged(new));
        }
        if !activated.is_empty() {
            self.advance_activations();
        }
    }

    /// Retract `features`. Dropping `BOUND` destroys the native handle,
    /// which takes every other feature with it.
    pub fn deactivate(&self, features: Features) {
        let active = self.active_features().intersection(features);
        self.0.behavior.deactivate(self, active);

        if features.contains(Features::BOUND) {
            let handle = self.handle();
            if let Some(handle) = handle {
                if let Some(core) = self.core() {
                    core.remote().destroy(handle);
                }
                self.handle_destroyed();
            }
        }

        {
            let mut st = self.0.state.borrow_mut();
            if active.contains(Features::INFO) {
                st.info = None;
            }
            if active.contains(Features::PARAMS) {
                st.params.clear();
            }
        }
        self.update_features(Features::empty(), active);
    }

    pub(crate) fn set_global(&self, global: Option<Global>) {
        self.0.state.borrow_mut().global = global;
    }

    pub(crate) fn clear_params(&self) {
        self.0.state.borrow_mut().params.clear();
    }

    fn watch_bind_error(&self, transition: &Transition) {
        self.0.state.borrow_mut().bind_watch = Some(transition.downgrade());
    }

    pub(crate) fn step_bind(&self, transition: &Transition) {
        self.watch_bind_error(transition);
        if self.handle().is_some() {
            // already requested; the acknowledgement advances us
            return;
        }
        let Some(core) = self.core() else {
            transition.return_error(SessionError::OperationFailed(
                "session core is gone; cannot bind proxy".to_string(),
            ));
            return;
        };

        let result = match (self.global(), &self.0.factory) {
            (Some(global), _) => match global.id() {
                Some(id) => {
                    trace!("{}: binding global {}", self, id);
                    core.remote().bind(id, &self.0.interface, self.0.version)
                }
                None => Err(SessionError::InvalidArgument(
                    "global was removed; cannot bind proxy".to_string(),
                )),
            },
            (None, Some(factory)) => {
                trace!("{}: creating object through {}", self, factory.name);
                core.remote().create_object(
                    &factory.name,
                    &self.0.interface,
                    self.0.version,
                    &factory.properties,
                )
            }
            (None, None) => Err(SessionError::InvalidArgument(
                "No global specified; cannot bind proxy".to_string(),
            )),
        };

        match result {
            Ok(handle) => {
                self.0.state.borrow_mut().handle = Some(handle);
                core.route(handle, self);
            }
            Err(e) => transition.return_error(e),
        }
    }

    pub(crate) fn handle_remote_event(&self, event: RemoteEvent) {
        match event {
            RemoteEvent::Bound { id, .. } => self.handle_bound(id),
            RemoteEvent::Destroyed { .. } => self.handle_destroyed(),
            RemoteEvent::Error {
                seq, code, message, ..
            } => self.handle_error(seq, code, message),
            RemoteEvent::Info { properties, .. } => self.handle_info(properties),
            RemoteEvent::Param { id, value, .. } => {
                self.0.state.borrow_mut().params.push((id, value));
            }
            other => warn!("{}: unexpected event {:?}", self, other),
        }
    }

    fn handle_bound(&self, id: u32) {
        let needs_global = {
            let mut st = self.0.state.borrow_mut();
            st.bound_id = Some(id);
            st.bind_watch = None;
            st.global.is_none()
        };
        debug!("{}: bound to global {}", self, id);

        if needs_global {
            if let Some(core) = self.core() {
                let properties = self
                    .0
                    .factory
                    .as_ref()
                    .map(|f| f.properties.clone())
                    .unwrap_or_default();
                let spec = GlobalSpec {
                    id,
                    claim: GlobalClaims::OWNED_BY_PROXY,
                    object_type: self.0.object_type,
                    interface: self.0.interface.clone(),
                    version: self.0.version,
                    permissions: Permissions::ALL,
                    properties,
                };
                if let Err(e) = core.registry().prepare(spec, Some(self)) {
                    warn!("{}: {}", self, e);
                }
            }
        }

        self.0.events.emit(&ProxyEvent::Bound(id));
        self.update_features(Features::BOUND, Features::empty());
    }

    fn handle_destroyed(&self) {
        let (handle, global) = {
            let mut st = self.0.state.borrow_mut();
            st.bound_id = None;
            st.info = None;
            st.params.clear();
            st.bind_watch = None;
            (st.handle.take(), st.global.clone())
        };
        let core = self.core();
        if let (Some(handle), Some(core)) = (handle, &core) {
            core.unroute(handle);
        }
        debug!("{}: native handle destroyed", self);

        self.update_features(
            Features::empty(),
            Features::BOUND | Features::INFO | Features::PARAMS,
        );
        self.0.events.emit(&ProxyEvent::Destroyed);
        self.abort_activation("native handle destroyed");

        if let (Some(global), Some(core)) = (global, core) {
            if global.claims().contains(GlobalClaims::OWNED_BY_PROXY) {
                core.registry().remove_claim(&global, GlobalClaims::OWNED_BY_PROXY);
            }
        }
    }

    fn handle_error(&self, seq: i32, code: i32, message: String) {
        let error = SessionError::Protocol { seq, code, message };
        warn!("{}: remote error: {}", self, error);

        let watcher = self
            .0
            .state
            .borrow_mut()
            .bind_watch
            .take()
            .and_then(|w| w.upgrade())
            .filter(|t| !t.completed());

        // a rejected bind leaves nothing worth keeping behind the handle
        if watcher.is_some() && self.bound_id().is_none() {
            let handle = self.0.state.borrow_mut().handle.take();
            if let (Some(handle), Some(core)) = (handle, self.core()) {
                core.unroute(handle);
                core.remote().destroy(handle);
            }
        }

        self.0.events.emit(&ProxyEvent::Error(error.clone()));
        if let Some(transition) = watcher {
            transition.return_error(error);
        }
    }

    fn handle_info(&self, properties: Properties) {
        let was_active = {
            let mut st = self.0.state.borrow_mut();
            st.info = Some(properties);
            st.features.contains(Features::INFO)
        };
        let newly_ready = !was_active && self.supported_features().contains(Features::INFO);

        self.0.events.emit(&ProxyEvent::InfoChanged);
        if newly_ready {
            self.update_features(Features::INFO, Features::empty());
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = self.0.state.try_borrow().ok().and_then(|st| st.bound_id);
        match bound {
            Some(id) => write!(f, "{}<{}>", self.0.object_type, id),
            None => write!(f, "{}<unbound>", self.0.object_type),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Proxy");
        s.field("type", &self.0.object_type)
            .field("interface", &self.0.interface);
        if let Ok(st) = self.0.state.try_borrow() {
            s.field("handle", &st.handle)
                .field("bound_id", &st.bound_id)
                .field("features", &st.features);
        }
        s.finish()
    }
}

/// Drives one activation through the proxy's behavior.
struct ActivationSteps {
    proxy: Proxy,
}

impl ActivationSteps {
    fn missing(&self, transition: &Transition) -> Features {
        let requested = transition.data::<Features>().unwrap_or_default();
        self.proxy.missing_features(requested)
    }
}

impl TransitionSteps for ActivationSteps {
    fn get_next_step(&mut self, transition: &Transition, step: Step) -> Step {
        let missing = self.missing(transition);
        if missing.is_empty() {
            return Step::None;
        }
        self.proxy.0.behavior.next_step(&self.proxy, step, missing)
    }

    fn execute_step(&mut self, transition: &Transition, step: Step) {
        let missing = self.missing(transition);
        self.proxy
            .0
            .behavior
            .execute_step(&self.proxy, transition, step, missing);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::remote::loopback::{LoopbackRemote, RemoteCall};
    use crate::type_registry::{interfaces, TypeRegistry};

    fn setup() -> (Core, Rc<LoopbackRemote>) {
        let remote = LoopbackRemote::new();
        let core = Core::new(remote.clone(), TypeRegistry::with_defaults());
        (core, remote)
    }

    fn record(proxy: &Proxy) -> Rc<RefCell<Option<Result<(), SessionError>>>> {
        let slot = Rc::new(RefCell::new(None));
        let out = slot.clone();
        proxy.activate(Features::BOUND, move |_, result| {
            *out.borrow_mut() = Some(result);
        });
        slot
    }

    #[test]
    fn test_factory_proxy_binds_and_registers_its_global() {
        let (core, remote) = setup();
        let proxy = Proxy::from_factory(
            &core,
            "adapter",
            interfaces::NODE,
            [("node.name", "made")].into_iter().collect(),
        )
        .unwrap();

        let result = record(&proxy);
        core.run_until_idle();

        assert_eq!(*result.borrow(), Some(Ok(())));
        let id = proxy.bound_id().unwrap();
        let global = core.global(id).unwrap();
        assert_eq!(global.claims(), GlobalClaims::all());
        assert!(global.proxy().is_some_and(|p| p.ptr_eq(&proxy)));
        assert_eq!(global.properties().get("node.name"), Some("made"));
        assert!(matches!(remote.calls()[0], RemoteCall::Create { .. }));
    }

    #[test]
    fn test_from_factory_rejects_unknown_interface() {
        let (core, _) = setup();
        let err = Proxy::from_factory(&core, "f", "Nope:Interface", Properties::new()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[test]
    fn test_concurrent_activations_share_one_bind() {
        let (core, remote) = setup();
        let id = remote.announce(interfaces::METADATA, 3, Properties::new());
        core.run_until_idle();
        let global = core.global(id).unwrap();
        let entry = core.types().lookup(interfaces::METADATA, 3).unwrap().clone();
        let proxy = Proxy::for_global(&core, &global, &entry);

        let done = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let done = done.clone();
            proxy.activate(Features::BOUND, move |_, result| {
                assert!(result.is_ok());
                done.set(done.get() + 1);
            });
        }
        core.run_until_idle();

        assert_eq!(done.get(), 3);
        assert_eq!(remote.bind_count(id), 1);
    }

    #[test]
    fn test_deactivate_bound_destroys_handle() {
        let (core, remote) = setup();
        let proxy = Proxy::from_factory(&core, "f", interfaces::NODE, Properties::new()).unwrap();
        record(&proxy);
        core.run_until_idle();
        let handle = proxy.handle().unwrap();

        proxy.deactivate(Features::BOUND);

        assert!(proxy.handle().is_none());
        assert!(proxy.active_features().is_empty());
        assert!(remote.calls().contains(&RemoteCall::Destroy { handle }));
    }

    #[test]
    fn test_unsupported_features_are_ignored() {
        let (core, remote) = setup();
        let id = remote.announce(interfaces::METADATA, 3, Properties::new());
        core.run_until_idle();
        let global = core.global(id).unwrap();
        let entry = core.types().lookup(interfaces::METADATA, 3).unwrap().clone();
        let proxy = Proxy::for_global(&core, &global, &entry);

        let result = Rc::new(RefCell::new(None));
        let out = result.clone();
        proxy.activate(Features::BOUND | Features::PARAMS, move |_, r| {
            *out.borrow_mut() = Some(r);
        });
        core.run_until_idle();

        assert_eq!(*result.borrow(), Some(Ok(())));
        assert_eq!(proxy.active_features(), Features::BOUND);
    }
}
