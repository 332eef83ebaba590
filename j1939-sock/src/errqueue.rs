use std::time::SystemTime;

use crate::transport::SessionStats;
use crate::Error;

/// Lifecycle points of an outbound session that produce a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrqueueKind {
    /// The peer acknowledged the complete message.
    Ack,
    /// The session was scheduled onto the wire.
    Sched,
    /// The session failed.
    Abort,
}

/// Origin of an extended error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrOrigin {
    Local,
    Timestamping,
}

/// Info code qualifying a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrInfo {
    TstampAck,
    TstampSched,
    TxAbort,
}

/// Typed key-value block attached to every notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptStats {
    /// Bytes of the message acknowledged so far.
    pub bytes_acked: usize,
}

/// A zero-payload message from the endpoint error queue.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Wall-clock time the event was produced.
    pub timestamp: SystemTime,
    /// Error the record carries; acknowledgements carry the no-message
    /// placeholder.
    pub error: Error,
    pub origin: ErrOrigin,
    pub info: ErrInfo,
    /// Timestamp key correlating the notification with its send call.
    pub tskey: u32,
    pub stats: OptStats,
}

impl Notification {
    pub(crate) fn new(kind: ErrqueueKind, stats: &SessionStats) -> Self {
        let (error, origin, info) = match kind {
            ErrqueueKind::Ack => (Error::NoMessage, ErrOrigin::Timestamping, ErrInfo::TstampAck),
            ErrqueueKind::Sched => {
                (Error::NoMessage, ErrOrigin::Timestamping, ErrInfo::TstampSched)
            }
            ErrqueueKind::Abort => (
                stats.err.unwrap_or(Error::InputOutput),
                ErrOrigin::Local,
                ErrInfo::TxAbort,
            ),
        };

        Self {
            timestamp: SystemTime::now(),
            error,
            origin,
            info,
            tskey: stats.tskey,
            stats: OptStats {
                bytes_acked: (stats.pkt_done as usize * 7).min(stats.total_message_size),
            },
        }
    }
}
