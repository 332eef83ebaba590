/// 64-bit J1939 NAME, the globally unique identity of a node.
///
/// The NAME is independent of the bus address a node happens to hold and
/// is carried in address-claim traffic as an 8-byte little-endian block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Name(u64);

impl Name {
    /// Construct a NAME from its raw value.
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw NAME value.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Construct a NAME from its wire representation.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    /// NAME as its wire representation.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Manufacturer-assigned serial number.
    pub fn identity_number(&self) -> u32 {
        (self.0 & 0x1F_FFFF) as u32
    }

    /// SAE-assigned manufacturer code.
    pub fn manufacturer_code(&self) -> u16 {
        ((self.0 >> 21) & 0x7FF) as u16
    }

    /// Instance of this ECU within a function.
    pub fn ecu_instance(&self) -> u8 {
        ((self.0 >> 32) & 0x7) as u8
    }

    /// Instance of this function within a vehicle system.
    pub fn function_instance(&self) -> u8 {
        ((self.0 >> 35) & 0x1F) as u8
    }

    /// SAE-assigned function identifier.
    pub fn function(&self) -> u8 {
        ((self.0 >> 40) & 0xFF) as u8
    }

    /// SAE-assigned vehicle system identifier.
    pub fn vehicle_system(&self) -> u8 {
        ((self.0 >> 49) & 0x7F) as u8
    }

    /// Instance of the vehicle system.
    pub fn vehicle_system_instance(&self) -> u8 {
        ((self.0 >> 56) & 0xF) as u8
    }

    /// SAE-assigned industry group.
    pub fn industry_group(&self) -> u8 {
        ((self.0 >> 60) & 0x7) as u8
    }

    /// Whether the node can negotiate another address on claim conflicts.
    pub fn arbitrary_address_capable(&self) -> bool {
        self.0 >> 63 != 0
    }
}

impl From<u64> for Name {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Name> for u64 {
    fn from(value: Name) -> Self {
        value.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Identity number: 0x{:X}; Manufacturer code: 0x{:X}; Function: 0x{:X}",
            self.identity_number(),
            self.manufacturer_code(),
            self.function()
        )
    }
}

/// NAME constructor.
#[derive(Default)]
pub struct NameBuilder {
    identity_number: u32,
    manufacturer_code: u16,
    ecu_instance: u8,
    function_instance: u8,
    function: u8,
    vehicle_system: u8,
    vehicle_system_instance: u8,
    industry_group: u8,
    arbitrary_address_capable: bool,
}

impl NameBuilder {
    pub fn identity_number(mut self, value: u32) -> Self {
        self.identity_number = value;
        self
    }

    pub fn manufacturer_code(mut self, value: u16) -> Self {
        self.manufacturer_code = value;
        self
    }

    pub fn ecu_instance(mut self, value: u8) -> Self {
        self.ecu_instance = value;
        self
    }

    pub fn function_instance(mut self, value: u8) -> Self {
        self.function_instance = value;
        self
    }

    pub fn function(mut self, value: u8) -> Self {
        self.function = value;
        self
    }

    pub fn vehicle_system(mut self, value: u8) -> Self {
        self.vehicle_system = value;
        self
    }

    pub fn vehicle_system_instance(mut self, value: u8) -> Self {
        self.vehicle_system_instance = value;
        self
    }

    pub fn industry_group(mut self, value: u8) -> Self {
        self.industry_group = value;
        self
    }

    pub fn arbitrary_address_capable(mut self, value: bool) -> Self {
        self.arbitrary_address_capable = value;
        self
    }

    pub fn build(self) -> Name {
        Name(
            (self.identity_number as u64 & 0x1F_FFFF)
                | (self.manufacturer_code as u64 & 0x7FF) << 21
                | (self.ecu_instance as u64 & 0x7) << 32
                | (self.function_instance as u64 & 0x1F) << 35
                | (self.function as u64) << 40
                | (self.vehicle_system as u64 & 0x7F) << 49
                | (self.vehicle_system_instance as u64 & 0xF) << 56
                | (self.industry_group as u64 & 0x7) << 60
                | (self.arbitrary_address_capable as u64) << 63,
        )
    }
}
