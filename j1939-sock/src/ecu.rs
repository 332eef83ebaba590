use std::sync::Mutex;

use j1939::{address_is_unicast, NO_NAME};

use crate::Error;

struct Claim {
    name: u64,
    addr: u8,
    users: usize,
}

/// Local-ECU claim table of one interface.
///
/// A claim binds a (NAME, address) identity for as long as an endpoint is
/// bound with it, so inbound frames addressed to that identity are
/// accepted. Claims are counted; several endpoints may share one
/// identity, but a unicast address cannot be claimed under two different
/// NAMEs.
pub struct EcuRegistry {
    claims: Mutex<Vec<Claim>>,
}

impl EcuRegistry {
    pub(crate) fn new() -> Self {
        Self {
            claims: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a hold on the identity.
    pub fn claim(&self, name: u64, addr: u8) -> Result<(), Error> {
        if name == NO_NAME && !address_is_unicast(addr) {
            // No identity to claim.
            return Ok(());
        }

        let mut claims = self.claims.lock().unwrap();

        if address_is_unicast(addr)
            && claims.iter().any(|c| c.addr == addr && c.name != name)
        {
            return Err(Error::AddressNotAvailable);
        }

        if let Some(claim) = claims.iter_mut().find(|c| c.name == name && c.addr == addr) {
            claim.users += 1;
        } else {
            claims.push(Claim {
                name,
                addr,
                users: 1,
            });
        }

        Ok(())
    }

    /// Drop a hold on the identity.
    pub fn release(&self, name: u64, addr: u8) {
        if name == NO_NAME && !address_is_unicast(addr) {
            return;
        }

        let mut claims = self.claims.lock().unwrap();

        if let Some(index) = claims.iter().position(|c| c.name == name && c.addr == addr) {
            claims[index].users -= 1;
            if claims[index].users == 0 {
                claims.remove(index);
            }
        } else {
            log::debug!("Release of unclaimed ECU 0x{:X}/0x{:X}", name, addr);
        }
    }

    /// Number of holds on the identity.
    pub fn users(&self, name: u64, addr: u8) -> usize {
        self.claims
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name == name && c.addr == addr)
            .map_or(0, |c| c.users)
    }

    /// Bus address a locally claimed NAME resolves to.
    pub fn address_of(&self, name: u64) -> Option<u8> {
        if name == NO_NAME {
            return None;
        }

        self.claims
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name == name && address_is_unicast(c.addr))
            .map(|c| c.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use j1939::NO_ADDR;

    #[test]
    fn claim_is_counted() {
        let ecu = EcuRegistry::new();

        ecu.claim(0xAA, 0x10).unwrap();
        ecu.claim(0xAA, 0x10).unwrap();
        assert_eq!(ecu.users(0xAA, 0x10), 2);

        ecu.release(0xAA, 0x10);
        assert_eq!(ecu.users(0xAA, 0x10), 1);
        ecu.release(0xAA, 0x10);
        assert_eq!(ecu.users(0xAA, 0x10), 0);
    }

    #[test]
    fn conflicting_name_on_same_address() {
        let ecu = EcuRegistry::new();

        ecu.claim(0xAA, 0x10).unwrap();
        assert_eq!(ecu.claim(0xBB, 0x10), Err(Error::AddressNotAvailable));

        // Another address is fine.
        ecu.claim(0xBB, 0x11).unwrap();
    }

    #[test]
    fn unassigned_identity_is_a_noop() {
        let ecu = EcuRegistry::new();

        ecu.claim(NO_NAME, NO_ADDR).unwrap();
        assert_eq!(ecu.users(NO_NAME, NO_ADDR), 0);
        ecu.release(NO_NAME, NO_ADDR);
    }

    #[test]
    fn resolve_claimed_name() {
        let ecu = EcuRegistry::new();

        ecu.claim(0xAA, 0x10).unwrap();
        assert_eq!(ecu.address_of(0xAA), Some(0x10));
        assert_eq!(ecu.address_of(0xBB), None);
        assert_eq!(ecu.address_of(NO_NAME), None);
    }
}
