use std::sync::{Arc, Mutex};

use j1939::{address_is_unicast, FrameBuilder, IdBuilder, BROADCAST_ADDR, NO_ADDR, NO_NAME};

use crate::device::CanDevice;
use crate::ecu::EcuRegistry;
use crate::endpoint::SockInner;
use crate::packet::Packet;
use crate::transport::TransportEngine;
use crate::Error;

/// Per-interface protocol instance.
///
/// Owns the list of endpoints bound to the interface, the local-ECU
/// claim table and the transmit side toward the device. Created when the
/// first endpoint binds to the interface, destroyed when the last one
/// releases.
pub struct Network {
    device: Arc<dyn CanDevice>,
    engine: Arc<dyn TransportEngine>,
    ecu: EcuRegistry,
    socks: Mutex<Vec<Arc<SockInner>>>,
}

impl Network {
    pub(crate) fn new(device: Arc<dyn CanDevice>, engine: Arc<dyn TransportEngine>) -> Self {
        Self {
            device,
            engine,
            ecu: EcuRegistry::new(),
            socks: Mutex::new(Vec::new()),
        }
    }

    /// Interface index this instance serves.
    #[inline]
    pub fn ifindex(&self) -> u32 {
        self.device.index()
    }

    /// The interface's local-ECU claim table.
    #[inline]
    pub fn ecu(&self) -> &EcuRegistry {
        &self.ecu
    }

    #[inline]
    pub(crate) fn engine(&self) -> &Arc<dyn TransportEngine> {
        &self.engine
    }

    pub(crate) fn attach(&self, sock: Arc<SockInner>) {
        self.socks.lock().unwrap().push(sock);
    }

    pub(crate) fn detach(&self, id: u64) {
        self.socks.lock().unwrap().retain(|s| s.id() != id);
    }

    /// Number of endpoints bound to the interface.
    pub fn endpoints(&self) -> usize {
        self.socks.lock().unwrap().len()
    }

    /// Fan an inbound datagram out to every endpoint on the interface.
    ///
    /// The list lock is held for the whole walk so datagrams reach all
    /// endpoints in arrival order; the per-endpoint clone and enqueue do
    /// not block.
    pub fn recv(&self, packet: &Packet) {
        let socks = self.socks.lock().unwrap();

        for sock in socks.iter() {
            sock.recv_one(packet);
        }
    }

    /// Transmit a single-frame datagram on the device, then loop it back
    /// to the interface's own endpoints.
    pub(crate) fn send_one(&self, packet: &Packet) -> Result<(), Error> {
        let cb = &packet.cb;

        let da = if cb.addr.dst_name != NO_NAME {
            match self.ecu.address_of(cb.addr.dst_name) {
                Some(addr) => addr,
                None if address_is_unicast(cb.addr.da) => cb.addr.da,
                None => return Err(Error::AddressNotAvailable),
            }
        } else if cb.addr.da == NO_ADDR {
            BROADCAST_ADDR
        } else {
            cb.addr.da
        };

        let sa = if address_is_unicast(cb.addr.sa) {
            cb.addr.sa
        } else {
            self.ecu
                .address_of(cb.addr.src_name)
                .ok_or(Error::AddressNotAvailable)?
        };

        let frame = FrameBuilder::new(
            IdBuilder::from_pgn(cb.addr.pgn)
                .priority(cb.priority)
                .sa(sa)
                .da(da)
                .build(),
        )
        .copy_from_slice(&packet.data)
        .build();

        log::trace!("[{}] Send {}", self.device.name(), frame);

        self.device.transmit(&frame)?;

        // Local delivery of our own transmission, the way the bus would
        // echo it. The origin in the control block keeps RECV_OWN and the
        // confirm flag honest.
        self.recv(packet);

        Ok(())
    }

    /// Propagate a device event to every endpoint on the interface.
    pub(crate) fn netdev_event(&self, error: Error) {
        let socks = self.socks.lock().unwrap();

        for sock in socks.iter() {
            sock.error_report(error);

            if error == Error::NoSuchDevice {
                sock.device_gone(self);
            }
        }
    }
}
