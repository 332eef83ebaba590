use std::sync::{Arc, Mutex, Weak};

use j1939::Frame;
use j1939_sock::{
    CanDevice, Error, Packet, PacketCb, SessionId, SessionKind, SockRef, Stack, TransportEngine,
};

/// Shared medium coupling the simulated nodes.
///
/// Every node hangs its own stack on the bus through a [`BusDevice`];
/// transmissions fan out to all other nodes on the same interface index,
/// the way frames appear on a physical segment.
#[derive(Default)]
pub struct VirtualBus {
    nodes: Mutex<Vec<BusNode>>,
}

struct BusNode {
    id: usize,
    ifindex: u32,
    stack: Weak<Stack>,
}

impl VirtualBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put a node on the bus and hand back its device.
    pub fn attach(
        bus: &Arc<VirtualBus>,
        ifindex: u32,
        name: &str,
        stack: &Arc<Stack>,
    ) -> Arc<BusDevice> {
        let id = {
            let mut nodes = bus.nodes.lock().unwrap();
            let id = nodes.len();
            nodes.push(BusNode {
                id,
                ifindex,
                stack: Arc::downgrade(stack),
            });
            id
        };

        Arc::new(BusDevice {
            bus: bus.clone(),
            id,
            ifindex,
            name: name.to_owned(),
        })
    }

    fn broadcast(&self, from: usize, ifindex: u32, frame: &Frame) {
        let nodes = self.nodes.lock().unwrap();

        for node in nodes.iter() {
            if node.id == from || node.ifindex != ifindex {
                continue;
            }

            if let Some(stack) = node.stack.upgrade() {
                stack.recv(&Packet::from_frame(ifindex, frame));
            }
        }
    }
}

/// One node's port on the virtual bus.
pub struct BusDevice {
    bus: Arc<VirtualBus>,
    id: usize,
    ifindex: u32,
    name: String,
}

impl CanDevice for BusDevice {
    fn index(&self) -> u32 {
        self.ifindex
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_can(&self) -> bool {
        true
    }

    fn transmit(&self, frame: &Frame) -> Result<(), Error> {
        self.bus.broadcast(self.id, self.ifindex, frame);
        Ok(())
    }
}

/// The simulator moves single frames only; sessions are refused.
pub struct NoTransport;

impl TransportEngine for NoTransport {
    fn tp_send(
        &self,
        _sock: SockRef,
        _packet: Packet,
        total_size: usize,
    ) -> Result<SessionId, Error> {
        log::warn!("Transport sessions not simulated, refusing {} bytes", total_size);

        Err(Error::InvalidArgument)
    }

    fn session_get(&self, _cb: &PacketCb, _kind: SessionKind) -> Result<SessionId, Error> {
        Err(Error::NotFound)
    }

    fn session_queue(&self, _session: SessionId, _packet: Packet) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    fn session_put(&self, _session: SessionId) {}
}
