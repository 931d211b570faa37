//! Boundary to the remote media server.
//!
//! The session core never speaks a wire protocol itself. It issues requests
//! through [`Remote`] and is fed [`RemoteEvent`]s in the order the peer
//! produced them.

pub mod loopback;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::flags::Permissions;
use crate::properties::Properties;

/// Opaque identifier of one native remote-object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeHandle(pub u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle:{}", self.0)
    }
}

/// Events delivered by the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The registry announced an object.
    Global {
        id: u32,
        permissions: Permissions,
        interface: String,
        version: u32,
        properties: Properties,
    },
    /// The registry withdrew an object.
    GlobalRemoved { id: u32 },
    /// The server acknowledged a bind or create request.
    Bound { handle: NativeHandle, id: u32 },
    /// The server destroyed the object behind a handle.
    Destroyed { handle: NativeHandle },
    Error {
        handle: NativeHandle,
        seq: i32,
        code: i32,
        message: String,
    },
    /// Info properties for a bound handle.
    Info {
        handle: NativeHandle,
        properties: Properties,
    },
    /// One enumerated parameter for a bound handle.
    Param {
        handle: NativeHandle,
        id: u32,
        value: serde_json::Value,
    },
    /// Round-trip acknowledgment for a [`Remote::sync`] request.
    Done { seq: u32 },
}

impl RemoteEvent {
    /// The handle a per-object event is addressed to.
    pub fn handle(&self) -> Option<NativeHandle> {
        match self {
            RemoteEvent::Bound { handle, .. }
            | RemoteEvent::Destroyed { handle }
            | RemoteEvent::Error { handle, .. }
            | RemoteEvent::Info { handle, .. }
            | RemoteEvent::Param { handle, .. } => Some(*handle),
            RemoteEvent::Global { .. } | RemoteEvent::GlobalRemoved { .. } | RemoteEvent::Done { .. } => {
                None
            }
        }
    }
}

/// Requests the session core issues to the remote peer.
///
/// Responses arrive later as [`RemoteEvent`]s through [`Remote::poll_event`].
pub trait Remote {
    /// Bind a registry global. The handle is usable immediately; the
    /// server confirms with `Bound` or rejects with `Error`.
    fn bind(&self, id: u32, interface: &str, version: u32) -> Result<NativeHandle, SessionError>;

    /// Ask a server-side factory to create an object.
    fn create_object(
        &self,
        factory: &str,
        interface: &str,
        version: u32,
        properties: &Properties,
    ) -> Result<NativeHandle, SessionError>;

    /// Destroy a handle locally. No event is echoed back.
    fn destroy(&self, handle: NativeHandle);

    /// Request every parameter of a bound object as `Param` events.
    fn enum_params(&self, handle: NativeHandle) -> Result<(), SessionError>;

    /// Issue a round-trip request; `Done { seq }` arrives after every
    /// earlier request has been answered.
    fn sync(&self) -> u32;

    fn poll_event(&self) -> Option<RemoteEvent>;
}
