use j1939_sock::StackConfig;

#[derive(Clone, Debug)]
pub struct SimConfig {
    /// CAN network interface.
    pub interface: String,
    /// Milliseconds between status transmissions.
    pub interval: u64,
    /// Number of transmissions, unbounded when unset.
    pub count: Option<u64>,
    /// Endpoint stack tunables.
    pub stack: StackConfig,
}
