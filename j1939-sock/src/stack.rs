use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::{CanDevice, DeviceResolver};
use crate::net::Network;
use crate::packet::Packet;
use crate::transport::TransportEngine;
use crate::{Error, StackConfig};

struct NetEntry {
    net: Arc<Network>,
    holders: usize,
}

/// Process-wide protocol registration.
///
/// The stack wires the device resolver and the transport engine
/// together; endpoints are opened on it. Per-interface instances come up
/// when the first endpoint binds to an interface and go away when the
/// last hold is dropped; constructing the stack registers the protocol,
/// dropping it tears everything down.
pub struct Stack {
    devices: Arc<dyn DeviceResolver>,
    engine: Arc<dyn TransportEngine>,
    config: StackConfig,
    nets: Mutex<HashMap<u32, NetEntry>>,
}

impl Stack {
    /// Register the protocol with default tunables.
    pub fn new(devices: Arc<dyn DeviceResolver>, engine: Arc<dyn TransportEngine>) -> Arc<Self> {
        Self::with_config(devices, engine, StackConfig::default())
    }

    /// Register the protocol with explicit tunables.
    pub fn with_config(
        devices: Arc<dyn DeviceResolver>,
        engine: Arc<dyn TransportEngine>,
        config: StackConfig,
    ) -> Arc<Self> {
        log::debug!("Register J1939 protocol");

        Arc::new(Self {
            devices,
            engine,
            config,
            nets: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The instance serving an interface, while any endpoint holds it.
    pub fn network(&self, ifindex: u32) -> Option<Arc<Network>> {
        self.nets
            .lock()
            .unwrap()
            .get(&ifindex)
            .map(|entry| entry.net.clone())
    }

    /// Deliver an inbound datagram to the interface it belongs to.
    ///
    /// This is the entry point for device glue and for the transport
    /// engine once it has reassembled a session. Datagrams for
    /// interfaces without bound endpoints are dropped.
    pub fn recv(&self, packet: &Packet) {
        match self.network(packet.cb.ifindex) {
            Some(net) => net.recv(packet),
            None => log::trace!("Datagram for idle interface {} dropped", packet.cb.ifindex),
        }
    }

    /// Propagate a device event to every endpoint on the interface.
    ///
    /// A `NoSuchDevice` event is terminal: endpoints lose their claims
    /// and instance holds and a later release short-circuits.
    pub fn netdev_event(&self, ifindex: u32, error: Error) {
        if let Some(net) = self.network(ifindex) {
            net.netdev_event(error);
        }
    }

    pub(crate) fn resolve_device(&self, ifindex: u32) -> Option<Arc<dyn CanDevice>> {
        self.devices.resolve(ifindex)
    }

    /// Bring up, or take another hold on, the interface's instance.
    pub(crate) fn netdev_start(&self, device: Arc<dyn CanDevice>) -> Arc<Network> {
        let mut nets = self.nets.lock().unwrap();

        let entry = nets.entry(device.index()).or_insert_with(|| {
            log::info!("J1939 instance up on {}", device.name());

            NetEntry {
                net: Arc::new(Network::new(device.clone(), self.engine.clone())),
                holders: 0,
            }
        });

        entry.holders += 1;
        entry.net.clone()
    }

    /// Drop a hold on the interface's instance, destroying it with the
    /// last one.
    pub(crate) fn netdev_stop(&self, ifindex: u32) {
        let mut nets = self.nets.lock().unwrap();

        if let Some(entry) = nets.get_mut(&ifindex) {
            entry.holders -= 1;
            if entry.holders == 0 {
                nets.remove(&ifindex);
                log::info!("J1939 instance down on interface {}", ifindex);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn holders(&self, ifindex: u32) -> usize {
        self.nets
            .lock()
            .unwrap()
            .get(&ifindex)
            .map_or(0, |entry| entry.holders)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        log::debug!("Unregister J1939 protocol");
    }
}
