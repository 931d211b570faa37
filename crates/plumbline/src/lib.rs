//! Plumbline: client-side session core for a graph-based media server.
//!
//! The remote server announces objects (nodes, ports, links, devices, ...)
//! on a registry. Plumbline mirrors them locally:
//!
//! - **Registry**: one [`Global`] per remote object, merged from the
//!   server's announcement and any proxy created from this side, exposed to
//!   watchers only after a round-trip barrier.
//! - **Proxies**: local handles that bind to remote objects and activate
//!   features (`BOUND`, `INFO`, `PARAMS`, custom bits) through a
//!   step-based [`Transition`].
//! - **Object managers**: declarative [`Interest`]s over the registry that
//!   create, activate and report matching objects, with one coalesced
//!   change notification per round trip.
//!
//! Everything is single-threaded; events are fed in order through
//! [`Core::handle_event`] or pulled from the [`Remote`] with
//! [`Core::run_until_idle`].

pub mod core;
pub mod error;
pub mod flags;
pub mod interest;
pub mod local_object;
pub mod object;
pub mod object_manager;
pub mod object_type;
pub mod pipewire_object;
pub mod properties;
pub mod proxy;
pub mod registry;
pub mod remote;
pub mod signal;
pub mod telemetry;
pub mod transition;
pub mod type_registry;

pub use crate::core::{Core, SessionSettings, WeakCore};
pub use error::{Result, SessionError};
pub use flags::{Features, GlobalClaims, Permissions};
pub use interest::{
    Constraint, ConstraintError, Interest, MatchResult, MatchSubject, Subject, Value, Verb,
};
pub use local_object::LocalObject;
pub use object::Object;
pub use object_manager::{ManagerEvent, ObjectManager};
pub use object_type::ObjectType;
pub use pipewire_object::PipewireObject;
pub use properties::Properties;
pub use proxy::{BoundOnly, Proxy, ProxyEvent, ProxyImpl, WeakProxy, STEP_BIND};
pub use registry::{Global, GlobalSpec, Registry};
pub use remote::loopback::{LoopbackRemote, RemoteCall};
pub use remote::{NativeHandle, Remote, RemoteEvent};
pub use signal::{HandlerId, Signal};
pub use transition::{Step, Transition, TransitionSteps, WeakTransition};
pub use type_registry::{interfaces, TypeEntry, TypeRegistry};
