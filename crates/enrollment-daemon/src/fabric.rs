//! In-memory N-1 flow fabric.
//!
//! Connects named processes inside one daemon. Each process reaches the
//! fabric through a [`FabricEndpoint`], which implements the channel and flow
//! allocator seams of the enrollment engine. Flow lifecycle outcomes and
//! inbound operations are delivered to the owning node's event queue, never
//! synchronously, so the caller always finishes its current event first.

use crate::node::NodeEvent;
use enrollment_core::messages::RemoteOperation;
use enrollment_core::transport::{self, FlowAllocator, FlowHandle, PortId, RemoteOperationChannel, TransportError};
use enrollment_core::Neighbor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The far end of a flow as seen from one port.
#[derive(Debug, Clone)]
struct Endpoint {
    peer: String,
    peer_port: PortId,
}

#[derive(Default)]
struct FabricState {
    /// Event queues of attached processes
    nodes: HashMap<String, mpsc::UnboundedSender<NodeEvent>>,
    /// (owner, port) -> far end
    flows: HashMap<(String, PortId), Endpoint>,
    next_port: PortId,
    next_handle: FlowHandle,
}

impl FabricState {
    fn deliver(&self, name: &str, event: NodeEvent) -> bool {
        match self.nodes.get(name) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

#[derive(Default)]
pub struct Fabric {
    state: Mutex<FabricState>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a process. Events for it are queued on `events`.
    pub fn attach(&self, name: &str, events: mpsc::UnboundedSender<NodeEvent>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.nodes.insert(name.to_string(), events).is_some() {
            warn!("{} re-attached to the fabric", name);
        }
    }

    /// View of the fabric for one process.
    pub fn endpoint(self: &Arc<Self>, name: &str) -> FabricEndpoint {
        FabricEndpoint {
            fabric: self.clone(),
            name: name.to_string(),
        }
    }

    /// Simulate a crash of `name`.
    ///
    /// Its flows are dropped without notifying anyone. Survivors keep their
    /// ends; what they send is discarded until they notice the silence.
    /// Returns the number of flow ends dropped.
    pub fn sever(&self, name: &str) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.nodes.remove(name);
        let before = state.flows.len();
        state.flows.retain(|(owner, _), _| owner != name);
        let dropped = before - state.flows.len();
        info!("Severed {} ({} flow ends dropped)", name, dropped);
        dropped
    }

    /// Flow ends currently open, counting both sides of each flow.
    pub fn open_ports(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flows
            .len()
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .nodes
            .contains_key(name)
    }

    fn allocate(&self, from: &str, neighbor: &Neighbor) -> transport::Result<FlowHandle> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.nodes.contains_key(from) {
            return Err(TransportError::AllocationFailed(format!(
                "{} is not attached",
                from
            )));
        }

        state.next_handle += 1;
        let handle = state.next_handle;

        if !state.nodes.contains_key(&neighbor.name) {
            debug!("Flow {} from {} to {}: unreachable", handle, from, neighbor.name);
            state.deliver(
                from,
                NodeEvent::FlowAllocationFailed {
                    handle,
                    reason: format!("{} is not reachable", neighbor.name),
                },
            );
            return Ok(handle);
        }

        let local_port = state.next_port + 1;
        let remote_port = state.next_port + 2;
        state.next_port += 2;

        state.flows.insert(
            (from.to_string(), local_port),
            Endpoint {
                peer: neighbor.name.clone(),
                peer_port: remote_port,
            },
        );
        state.flows.insert(
            (neighbor.name.clone(), remote_port),
            Endpoint {
                peer: from.to_string(),
                peer_port: local_port,
            },
        );

        debug!(
            "Flow {} allocated: {}:{} <-> {}:{}",
            handle, from, local_port, neighbor.name, remote_port
        );
        state.deliver(
            from,
            NodeEvent::FlowAllocated {
                handle,
                port: local_port,
            },
        );
        Ok(handle)
    }

    fn send(&self, from: &str, port: PortId, operation: RemoteOperation) -> transport::Result<()> {
        let data = operation
            .to_json()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let endpoint = state
            .flows
            .get(&(from.to_string(), port))
            .ok_or(TransportError::PortNotFound(port))?;

        let event = NodeEvent::Operation {
            port: endpoint.peer_port,
            data,
        };
        if !state.deliver(&endpoint.peer, event) {
            debug!(
                "Dropping {} from {}: {} is gone",
                operation.kind(),
                from,
                endpoint.peer
            );
        }
        Ok(())
    }

    fn deallocate(&self, from: &str, port: PortId) -> transport::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let endpoint = state
            .flows
            .remove(&(from.to_string(), port))
            .ok_or(TransportError::PortNotFound(port))?;
        state
            .flows
            .remove(&(endpoint.peer.clone(), endpoint.peer_port));

        debug!(
            "Flow {}:{} <-> {}:{} deallocated",
            from, port, endpoint.peer, endpoint.peer_port
        );
        state.deliver(from, NodeEvent::FlowDeallocated { port });
        state.deliver(
            &endpoint.peer,
            NodeEvent::FlowDeallocated {
                port: endpoint.peer_port,
            },
        );
        Ok(())
    }
}

/// One process's attachment to the [`Fabric`].
#[derive(Clone)]
pub struct FabricEndpoint {
    fabric: Arc<Fabric>,
    name: String,
}

impl FabricEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl RemoteOperationChannel for FabricEndpoint {
    fn send(&self, port: PortId, operation: RemoteOperation) -> transport::Result<()> {
        self.fabric.send(&self.name, port, operation)
    }
}

impl FlowAllocator for FabricEndpoint {
    fn allocate_flow(&self, neighbor: &Neighbor) -> transport::Result<FlowHandle> {
        self.fabric.allocate(&self.name, neighbor)
    }

    fn deallocate_flow(&self, port: PortId) -> transport::Result<()> {
        self.fabric.deallocate(&self.name, port)
    }
}
