//! In-process remote peer.
//!
//! Keeps a table of server objects and answers requests by queueing the
//! events a real server would send, in the same order. Knobs let callers
//! hold bind acknowledgements back, reject binds, or reorder the two
//! events produced by object creation.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use tracing::debug;

use super::{NativeHandle, Remote, RemoteEvent};
use crate::error::SessionError;
use crate::flags::Permissions;
use crate::properties::Properties;

/// A request received by the loopback peer, recorded for inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Bind { id: u32, handle: NativeHandle },
    Create { factory: String, handle: NativeHandle },
    Destroy { handle: NativeHandle },
    EnumParams { handle: NativeHandle },
    Sync { seq: u32 },
}

#[derive(Debug, Clone)]
struct ServerObject {
    interface: String,
    permissions: Permissions,
    properties: Properties,
    params: Vec<(u32, serde_json::Value)>,
    /// Reject binds with this (code, message).
    deny: Option<(i32, String)>,
}

#[derive(Debug)]
struct LoopbackState {
    queue: VecDeque<RemoteEvent>,
    objects: BTreeMap<u32, ServerObject>,
    handles: HashMap<NativeHandle, u32>,
    held: Vec<(NativeHandle, u32)>,
    calls: Vec<RemoteCall>,
    next_id: u32,
    next_handle: u64,
    next_seq: u32,
    hold_binds: bool,
    send_info: bool,
    bound_before_global: bool,
}

impl Default for LoopbackState {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            objects: BTreeMap::new(),
            handles: HashMap::new(),
            held: Vec::new(),
            calls: Vec::new(),
            next_id: 0,
            next_handle: 1,
            next_seq: 0,
            hold_binds: false,
            send_info: true,
            bound_before_global: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoopbackRemote {
    state: RefCell<LoopbackState>,
}

impl LoopbackRemote {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Announce a server object on the registry; returns its id.
    pub fn announce(&self, interface: &str, version: u32, properties: Properties) -> u32 {
        let mut st = self.state.borrow_mut();
        let id = st.next_id;
        st.next_id = st.next_id.saturating_add(1);
        Self::insert_object(&mut st, id, interface, version, properties);
        id
    }

    /// Announce a server object at a specific id.
    pub fn announce_at(&self, id: u32, interface: &str, version: u32, properties: Properties) {
        let mut st = self.state.borrow_mut();
        st.next_id = st.next_id.max(id.saturating_add(1));
        Self::insert_object(&mut st, id, interface, version, properties);
    }

    fn insert_object(
        st: &mut LoopbackState,
        id: u32,
        interface: &str,
        version: u32,
        properties: Properties,
    ) {
        let object = ServerObject {
            interface: interface.to_string(),
            permissions: Permissions::ALL,
            properties: properties.clone(),
            params: Vec::new(),
            deny: None,
        };
        st.queue.push_back(RemoteEvent::Global {
            id,
            permissions: object.permissions,
            interface: object.interface.clone(),
            version,
            properties,
        });
        st.objects.insert(id, object);
    }

    /// Withdraw an object from the registry.
    pub fn retract(&self, id: u32) {
        let mut st = self.state.borrow_mut();
        st.objects.remove(&id);
        st.queue.push_back(RemoteEvent::GlobalRemoved { id });
    }

    /// Destroy the object behind `handle` from the server side.
    pub fn revoke(&self, handle: NativeHandle) {
        let mut st = self.state.borrow_mut();
        st.handles.remove(&handle);
        st.queue.push_back(RemoteEvent::Destroyed { handle });
    }

    /// Make later binds of `id` fail with a remote error.
    pub fn deny_bind(&self, id: u32, code: i32, message: &str) {
        if let Some(object) = self.state.borrow_mut().objects.get_mut(&id) {
            object.deny = Some((code, message.to_string()));
        }
    }

    pub fn add_param(&self, id: u32, param_id: u32, value: serde_json::Value) {
        if let Some(object) = self.state.borrow_mut().objects.get_mut(&id) {
            object.params.push((param_id, value));
        }
    }

    /// Queue `Bound` acknowledgements instead of sending them.
    pub fn set_hold_binds(&self, hold: bool) {
        self.state.borrow_mut().hold_binds = hold;
    }

    /// Send every held acknowledgement now.
    pub fn release_binds(&self) {
        let mut st = self.state.borrow_mut();
        let held = std::mem::take(&mut st.held);
        for (handle, id) in held {
            Self::acknowledge(&mut st, handle, id);
        }
    }

    pub fn set_send_info(&self, send: bool) {
        self.state.borrow_mut().send_info = send;
    }

    /// Order of the `Bound` and `Global` events produced by object creation.
    pub fn set_bound_before_global(&self, bound_first: bool) {
        self.state.borrow_mut().bound_before_global = bound_first;
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.borrow().calls.clone()
    }

    pub fn bind_count(&self, id: u32) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| matches!(c, RemoteCall::Bind { id: bound, .. } if *bound == id))
            .count()
    }

    /// Live handles for `id`.
    pub fn handles_for(&self, id: u32) -> Vec<NativeHandle> {
        let st = self.state.borrow();
        let mut handles: Vec<NativeHandle> = st
            .handles
            .iter()
            .filter(|(_, bound)| **bound == id)
            .map(|(h, _)| *h)
            .collect();
        handles.sort();
        handles
    }

    pub fn pending_events(&self) -> usize {
        self.state.borrow().queue.len()
    }

    fn acknowledge(st: &mut LoopbackState, handle: NativeHandle, id: u32) {
        if !st.handles.contains_key(&handle) {
            debug!("loopback: {} destroyed before acknowledgement", handle);
            return;
        }
        st.queue.push_back(RemoteEvent::Bound { handle, id });
        if st.send_info {
            if let Some(object) = st.objects.get(&id) {
                let properties = object.properties.clone();
                st.queue.push_back(RemoteEvent::Info { handle, properties });
            }
        }
    }

    fn new_handle(st: &mut LoopbackState) -> NativeHandle {
        let handle = NativeHandle(st.next_handle);
        st.next_handle += 1;
        handle
    }
}

impl Remote for LoopbackRemote {
    fn bind(&self, id: u32, interface: &str, _version: u32) -> Result<NativeHandle, SessionError> {
        let mut st = self.state.borrow_mut();
        let Some(object) = st.objects.get(&id).cloned() else {
            return Err(SessionError::OperationFailed(format!(
                "no global with id {id}"
            )));
        };
        if object.interface != interface {
            return Err(SessionError::InvalidArgument(format!(
                "global {id} is a {}, not a {interface}",
                object.interface
            )));
        }

        let handle = Self::new_handle(&mut st);
        st.handles.insert(handle, id);
        st.calls.push(RemoteCall::Bind { id, handle });

        if let Some((code, message)) = object.deny {
            st.queue.push_back(RemoteEvent::Error {
                handle,
                seq: 0,
                code,
                message,
            });
        } else if st.hold_binds {
            st.held.push((handle, id));
        } else {
            Self::acknowledge(&mut st, handle, id);
        }
        Ok(handle)
    }

    fn create_object(
        &self,
        factory: &str,
        interface: &str,
        version: u32,
        properties: &Properties,
    ) -> Result<NativeHandle, SessionError> {
        let mut st = self.state.borrow_mut();
        let handle = Self::new_handle(&mut st);
        let id = st.next_id;
        st.next_id = st.next_id.saturating_add(1);

        let mut props = properties.clone();
        props.set("factory.name", factory);
        st.objects.insert(
            id,
            ServerObject {
                interface: interface.to_string(),
                permissions: Permissions::ALL,
                properties: props.clone(),
                params: Vec::new(),
                deny: None,
            },
        );
        st.handles.insert(handle, id);
        st.calls.push(RemoteCall::Create {
            factory: factory.to_string(),
            handle,
        });

        let global = RemoteEvent::Global {
            id,
            permissions: Permissions::ALL,
            interface: interface.to_string(),
            version,
            properties: props,
        };
        if st.bound_before_global {
            Self::acknowledge(&mut st, handle, id);
            st.queue.push_back(global);
        } else {
            st.queue.push_back(global);
            Self::acknowledge(&mut st, handle, id);
        }
        Ok(handle)
    }

    fn destroy(&self, handle: NativeHandle) {
        let mut st = self.state.borrow_mut();
        st.handles.remove(&handle);
        st.calls.push(RemoteCall::Destroy { handle });
    }

    fn enum_params(&self, handle: NativeHandle) -> Result<(), SessionError> {
        let mut st = self.state.borrow_mut();
        let Some(id) = st.handles.get(&handle).copied() else {
            return Err(SessionError::OperationFailed(format!("unknown {handle}")));
        };
        st.calls.push(RemoteCall::EnumParams { handle });
        let params = st
            .objects
            .get(&id)
            .map(|o| o.params.clone())
            .unwrap_or_default();
        for (param_id, value) in params {
            st.queue.push_back(RemoteEvent::Param {
                handle,
                id: param_id,
                value,
            });
        }
        Ok(())
    }

    fn sync(&self) -> u32 {
        let mut st = self.state.borrow_mut();
        st.next_seq += 1;
        let seq = st.next_seq;
        st.calls.push(RemoteCall::Sync { seq });
        st.queue.push_back(RemoteEvent::Done { seq });
        seq
    }

    fn poll_event(&self) -> Option<RemoteEvent> {
        self.state.borrow_mut().queue.pop_front()
    }
}
