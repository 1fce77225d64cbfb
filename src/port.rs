//! Ports and the push/pull calling conventions.
//!
//! Packets move between adjacent elements through direct synchronous
//! calls: a push travels producer→consumer through [`Port::push`], a pull
//! travels consumer→producer through [`Port::pull`]. Both are plain stack
//! calls resolved once at graph-build time; the scheduler is not involved
//! in moving packets, only in deciding when an element's task runs.

use std::sync::Arc;

use crate::element::Element;
use crate::packet::Packet;

/// Statically declared discipline of a port. Agnostic ports adopt the
/// discipline of whatever they are connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Push,
    Pull,
    Agnostic,
}

/// A resolved connection endpoint: the peer element and the peer's port
/// number. Held by the element on the initiating side of the call.
#[derive(Clone)]
pub struct Port {
    element: Arc<dyn Element>,
    port: usize,
}

impl Port {
    pub(crate) fn new(element: Arc<dyn Element>, port: usize) -> Port {
        Port { element, port }
    }

    /// Hands `packet` to the peer, transferring ownership. The peer may
    /// itself push further downstream before this call returns.
    pub fn push(&self, packet: Packet) {
        self.element.push(self.port, packet);
    }

    /// Asks the peer for one packet; `None` means none available now.
    pub fn pull(&self) -> Option<Packet> {
        self.element.pull(self.port)
    }

    pub fn element(&self) -> &Arc<dyn Element> {
        &self.element
    }

    pub fn index(&self) -> usize {
        self.port
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("peer", &self.element.class_name())
            .field("port", &self.port)
            .finish()
    }
}

/// An element's resolved ports, handed over during `initialize`.
///
/// Only the initiating side of each connection gets a handle: a push
/// producer holds its output ports, a pull consumer holds its input
/// ports. The other sides are reached by being called.
#[derive(Clone, Default)]
pub struct Ports {
    inputs: Vec<Option<Port>>,
    outputs: Vec<Option<Port>>,
}

impl Ports {
    pub(crate) fn new(ninputs: usize, noutputs: usize) -> Ports {
        Ports {
            inputs: vec![None; ninputs],
            outputs: vec![None; noutputs],
        }
    }

    pub(crate) fn set_input(&mut self, port: usize, peer: Port) {
        self.inputs[port] = Some(peer);
    }

    pub(crate) fn set_output(&mut self, port: usize, peer: Port) {
        self.outputs[port] = Some(peer);
    }

    pub fn ninputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn noutputs(&self) -> usize {
        self.outputs.len()
    }

    /// The upstream peer of pull input `port`, if that port is the
    /// initiating side of a pull connection.
    pub fn input(&self, port: usize) -> Option<&Port> {
        self.inputs.get(port).and_then(Option::as_ref)
    }

    /// The downstream peer of push output `port`, if that port is the
    /// initiating side of a push connection.
    pub fn output(&self, port: usize) -> Option<&Port> {
        self.outputs.get(port).and_then(Option::as_ref)
    }
}
