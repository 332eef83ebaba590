// Copyright (C) 2024 Laixer Equipment B.V.
// All rights reserved.
//
// This software may be modified and distributed under the terms
// of the included license.  See the LICENSE file for details.

//! J1939 datagram endpoint layer.
//!
//! This crate sits between user code exchanging datagrams with J1939
//! addressing metadata and the protocol machinery underneath: CAN
//! devices on the transmit side, a transport-protocol engine for
//! anything larger than a single frame, and per-interface bookkeeping
//! of bound endpoints and claimed local ECU identities.
//!
//! A [`Stack`] ties a device resolver and a transport engine together;
//! endpoints are opened on it, bound to an interface and exchanged
//! datagrams with:
//!
//! ```no_run
//! # async fn example(stack: std::sync::Arc<j1939_sock::Stack>) -> Result<(), j1939_sock::Error> {
//! use j1939_sock::{SockAddrJ1939, Socket};
//!
//! let endpoint = Socket::open(&stack);
//! endpoint.bind(&SockAddrJ1939::new(1).with_addr(0x10)).await?;
//!
//! let datagram = endpoint.recv().await?;
//! println!("{} bytes from 0x{:02X}", datagram.data.len(), datagram.source.addr);
//! # Ok(())
//! # }
//! ```

pub use j1939;

mod config;
mod device;
mod ecu;
mod endpoint;
mod errqueue;
mod error;
mod filter;
mod net;
mod packet;
mod queue;
mod stack;
mod transport;

pub use config::{from_toml, StackConfig};
pub use device::{CanDevice, DeviceResolver, StaticDevices, Vcan};
pub use ecu::EcuRegistry;
pub use endpoint::{SockRef, Socket};
pub use errqueue::{ErrInfo, ErrOrigin, ErrqueueKind, Notification, OptStats};
pub use error::Error;
pub use filter::Filter;
pub use net::Network;
pub use packet::{Datagram, MsgFlags, Packet, PacketCb};
pub use stack::Stack;
pub use transport::{SessionId, SessionKind, SessionStats, TransportEngine};

use j1939::{Pgn, NO_ADDR, NO_NAME};

/// User-facing J1939 endpoint address.
///
/// Carries the interface index next to the J1939 triple of NAME, bus
/// address and parameter group. Unused members stay at their sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddrJ1939 {
    /// Interface index, 0 when unspecified.
    pub ifindex: u32,
    /// 64-bit NAME, 0 when unused.
    pub name: u64,
    /// Parameter group number.
    pub pgn: Pgn,
    /// 8-bit bus address.
    pub addr: u8,
}

impl SockAddrJ1939 {
    /// An address on the interface with every member unset.
    pub fn new(ifindex: u32) -> Self {
        Self {
            ifindex,
            name: NO_NAME,
            pgn: Pgn::NONE,
            addr: NO_ADDR,
        }
    }

    /// Set the bus address.
    pub fn with_addr(mut self, addr: u8) -> Self {
        self.addr = addr;
        self
    }

    /// Set the NAME.
    pub fn with_name(mut self, name: u64) -> Self {
        self.name = name;
        self
    }

    /// Set the parameter group.
    pub fn with_pgn(mut self, pgn: Pgn) -> Self {
        self.pgn = pgn;
        self
    }
}
