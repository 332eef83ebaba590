use bytes::Bytes;
use j1939::{address_is_valid, Addr, Frame, NO_ADDR, NO_NAME};

use crate::SockAddrJ1939;

/// Flags annotated on delivered datagrams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags(u32);

impl MsgFlags {
    /// The datagram originated at a local endpoint.
    pub const DONTROUTE: MsgFlags = MsgFlags(1 << 0);
    /// The datagram originated at the receiving endpoint itself.
    pub const CONFIRM: MsgFlags = MsgFlags(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub fn contains(&self, other: MsgFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: MsgFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: MsgFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for MsgFlags {
    type Output = MsgFlags;

    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

/// Control block traveling with every datagram through the stack.
#[derive(Debug, Clone)]
pub struct PacketCb {
    /// Addressing metadata of the datagram.
    pub addr: Addr,
    /// Wire priority, 0 the most urgent.
    pub priority: u8,
    /// Message flags.
    pub flags: MsgFlags,
    /// Byte offset of this segment within its datagram.
    pub offset: usize,
    /// Identity of the originating local endpoint, if any.
    pub origin: Option<u64>,
    /// Interface the datagram belongs to.
    pub ifindex: u32,
}

/// A datagram, or a segment of one, with its control block.
///
/// The payload is reference counted so the per-endpoint inbound clone is
/// cheap.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub cb: PacketCb,
}

impl Packet {
    /// Lift a received CAN frame into a packet.
    ///
    /// PDU2 groups carry no destination; their destination address stays
    /// unassigned, which routes them through the broadcast policy.
    pub fn from_frame(ifindex: u32, frame: &Frame) -> Self {
        let id = frame.id();

        Self {
            data: Bytes::copy_from_slice(frame.as_ref()),
            cb: PacketCb {
                addr: Addr {
                    pgn: id.pgn(),
                    sa: id.source_address(),
                    da: id.destination_address().unwrap_or(NO_ADDR),
                    src_name: NO_NAME,
                    dst_name: NO_NAME,
                },
                priority: id.priority(),
                flags: MsgFlags::empty(),
                offset: 0,
                origin: None,
                ifindex,
            },
        }
    }
}

/// A datagram as handed to the receiving user, payload plus the
/// source address and the ancillary fields.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Payload bytes.
    pub data: Bytes,
    /// Source side of the datagram.
    pub source: SockAddrJ1939,
    /// Destination address, when the inbound destination was assigned.
    pub dest_addr: Option<u8>,
    /// Destination NAME, when known.
    pub dest_name: Option<u64>,
    /// Wire priority the datagram was sent with.
    pub priority: u8,
    /// Message flags.
    pub flags: MsgFlags,
}

impl Datagram {
    pub(crate) fn from_packet(packet: &Packet, flags: MsgFlags) -> Self {
        let cb = &packet.cb;

        Self {
            data: packet.data.clone(),
            source: SockAddrJ1939 {
                ifindex: cb.ifindex,
                name: cb.addr.src_name,
                pgn: cb.addr.pgn,
                addr: cb.addr.sa,
            },
            dest_addr: address_is_valid(cb.addr.da).then_some(cb.addr.da),
            dest_name: (cb.addr.dst_name != NO_NAME).then_some(cb.addr.dst_name),
            priority: cb.priority,
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use j1939::{IdBuilder, Pgn, BROADCAST_ADDR};

    #[test]
    fn msg_flags_bits() {
        let mut flags = MsgFlags::empty();
        assert!(!flags.contains(MsgFlags::DONTROUTE));

        flags.insert(MsgFlags::DONTROUTE);
        flags.insert(MsgFlags::CONFIRM);
        assert!(flags.contains(MsgFlags::DONTROUTE | MsgFlags::CONFIRM));

        flags.remove(MsgFlags::CONFIRM);
        assert!(flags.contains(MsgFlags::DONTROUTE));
        assert!(!flags.contains(MsgFlags::CONFIRM));
    }

    #[test]
    fn packet_from_pdu1_frame() {
        let frame = j1939::FrameBuilder::new(
            IdBuilder::from_pgn(Pgn::new(0xEA00)).sa(0x10).da(0x20).build(),
        )
        .copy_from_slice(&[1, 2, 3])
        .build();

        let packet = Packet::from_frame(1, &frame);

        assert_eq!(packet.cb.addr.pgn, Pgn::new(0xEA00));
        assert_eq!(packet.cb.addr.sa, 0x10);
        assert_eq!(packet.cb.addr.da, 0x20);
        assert_eq!(packet.data.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn packet_from_pdu2_frame_has_no_destination() {
        let frame = j1939::FrameBuilder::new(
            IdBuilder::from_pgn(Pgn::new(0x1F004)).sa(0x10).da(0x20).build(),
        )
        .copy_from_slice(&[0xAA])
        .build();

        let packet = Packet::from_frame(1, &frame);

        assert_eq!(packet.cb.addr.da, NO_ADDR);

        let datagram = Datagram::from_packet(&packet, MsgFlags::empty());
        assert_eq!(datagram.dest_addr, None);
    }

    #[test]
    fn datagram_reports_broadcast_destination() {
        let mut packet = Packet::from_frame(1, &j1939::FrameBuilder::new(
            IdBuilder::from_pgn(Pgn::new(0xEA00)).sa(0x10).da(BROADCAST_ADDR).build(),
        )
        .copy_from_slice(&[0x55])
        .build());
        packet.cb.addr.dst_name = 0x1234;

        let datagram = Datagram::from_packet(&packet, MsgFlags::empty());

        assert_eq!(datagram.dest_addr, Some(BROADCAST_ADDR));
        assert_eq!(datagram.dest_name, Some(0x1234));
        assert_eq!(datagram.source.addr, 0x10);
    }
}
