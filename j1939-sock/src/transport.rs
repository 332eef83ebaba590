use j1939::MAX_TP_PACKET_SIZE;

use crate::endpoint::SockRef;
use crate::packet::{Packet, PacketCb};
use crate::Error;

/// Identifies an outbound session within the transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Which transport protocol flavor carries a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// BAM or destination-specific transport, up to 1785 bytes.
    Regular,
    /// Extended transport for anything larger.
    Extended,
}

impl SessionKind {
    /// Flavor required for a datagram of the given total size.
    pub fn for_size(total_size: usize) -> Self {
        if total_size > MAX_TP_PACKET_SIZE {
            SessionKind::Extended
        } else {
            SessionKind::Regular
        }
    }
}

/// Progress snapshot the engine reports alongside session events.
#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    /// Transport packets acknowledged so far.
    pub pkt_done: u32,
    /// Total size of the message the session carries.
    pub total_message_size: usize,
    /// Error the session was aborted with, if any.
    pub err: Option<Error>,
    /// Timestamp key correlating notifications with the send call.
    pub tskey: u32,
}

/// The transport-protocol engine segmented datagrams are handed to.
///
/// The engine owns session state, timers and retransmission; the
/// endpoint layer only creates sessions, attaches segments and drops its
/// reference when a send call completes. The engine reports back through
/// the [`SockRef`](crate::SockRef) it received when the session was
/// created.
pub trait TransportEngine: Send + Sync {
    /// Open a session carrying `total_size` bytes in all, seeded with the
    /// datagram's first segment.
    fn tp_send(&self, sock: SockRef, packet: Packet, total_size: usize)
        -> Result<SessionId, Error>;

    /// Find the in-flight session a further segment continues.
    fn session_get(&self, cb: &PacketCb, kind: SessionKind) -> Result<SessionId, Error>;

    /// Attach a segment to the session.
    fn session_queue(&self, session: SessionId, packet: Packet) -> Result<(), Error>;

    /// Drop the caller's reference on the session.
    fn session_put(&self, session: SessionId);
}
