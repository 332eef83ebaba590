use std::sync::{Arc, Mutex};

use j1939::Frame;

use crate::Error;

/// A CAN network device as the endpoint layer sees it.
///
/// The trait hides the actual driver; the stack only resolves, type
/// checks and transmits.
pub trait CanDevice: Send + Sync {
    /// Interface index of the device.
    fn index(&self) -> u32;

    /// Interface name, for diagnostics.
    fn name(&self) -> &str;

    /// Whether this is CAN-type hardware. Binding refuses anything else.
    fn is_can(&self) -> bool;

    /// Queue a single frame for transmission.
    fn transmit(&self, frame: &Frame) -> Result<(), Error>;
}

/// Resolves interface indices to devices.
pub trait DeviceResolver: Send + Sync {
    fn resolve(&self, ifindex: u32) -> Option<Arc<dyn CanDevice>>;
}

/// Fixed device table, sufficient for embedders that register their
/// interfaces up front.
#[derive(Default)]
pub struct StaticDevices {
    devices: Mutex<Vec<Arc<dyn CanDevice>>>,
}

impl StaticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. A later registration with the same index wins.
    pub fn insert(&self, device: Arc<dyn CanDevice>) {
        self.devices.lock().unwrap().insert(0, device);
    }
}

impl DeviceResolver for StaticDevices {
    fn resolve(&self, ifindex: u32) -> Option<Arc<dyn CanDevice>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.index() == ifindex)
            .cloned()
    }
}

/// In-process CAN device that records everything it transmits.
pub struct Vcan {
    index: u32,
    name: String,
    frames: Mutex<Vec<Frame>>,
}

impl Vcan {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Frames transmitted so far.
    pub fn sent(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }
}

impl CanDevice for Vcan {
    fn index(&self) -> u32 {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_can(&self) -> bool {
        true
    }

    fn transmit(&self, frame: &Frame) -> Result<(), Error> {
        log::trace!("[{}] Send {}", self.name, frame);

        self.frames.lock().unwrap().push(*frame);
        Ok(())
    }
}
