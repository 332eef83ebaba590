use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use j1939::{
    from_generic_priority, to_generic_priority, Addr, Pgn, BROADCAST_ADDR, MAX_ETP_PACKET_SIZE,
    MAX_TP_PACKET_SIZE, NO_ADDR, NO_NAME,
};
use tokio::sync::Notify;

use crate::errqueue::{ErrqueueKind, Notification};
use crate::filter::{self, EndpointView, Filter};
use crate::net::Network;
use crate::packet::{Datagram, MsgFlags, Packet, PacketCb};
use crate::queue::RecvQueue;
use crate::stack::Stack;
use crate::transport::{SessionId, SessionKind, SessionStats};
use crate::{Error, SockAddrJ1939};

const BOUND: u32 = 1 << 0;
const CONNECTED: u32 = 1 << 1;
const PROMISC: u32 = 1 << 2;
const RECV_OWN: u32 = 1 << 3;
const ERRQUEUE: u32 = 1 << 4;
const DEVICE_GONE: u32 = 1 << 5;
const CLOSED: u32 = 1 << 6;

static SOCK_ID: AtomicU64 = AtomicU64::new(1);

struct SockState {
    state: u32,
    /// Interface the endpoint is bound to, fixed by the first bind.
    ifindex: u32,
    /// Local (source) and peer (destination) addressing.
    addr: Addr,
    /// Parameter group filter taken from the bind address.
    pgn_rx_filter: Pgn,
    /// User-installed filter list, swapped out as a whole.
    filters: Arc<[Filter]>,
    /// Send priority on the inverted generic scale.
    generic_priority: u8,
    /// Permission to address the broadcast.
    broadcast: bool,
    /// Total size of the segmented datagram in flight.
    tx_complete_size: usize,
    /// Bytes of it handed to the transport engine so far.
    tx_done_size: usize,
    /// Hold on the interface instance for the bound lifetime.
    net: Option<Arc<Network>>,
}

pub(crate) struct SockInner {
    id: u64,
    stack: Weak<Stack>,
    /// Serializes the state-mutating endpoint operations.
    op: tokio::sync::Mutex<()>,
    state: Mutex<SockState>,
    /// Outbound buffers owned by the transport engine but not yet freed.
    pending: AtomicUsize,
    /// Signaled when the pending counter reaches zero.
    drained: Notify,
    rx: RecvQueue<Datagram>,
    errq: RecvQueue<Notification>,
    /// One-shot asynchronous error, surfaced by the next send or receive.
    err: Mutex<Option<Error>>,
}

impl SockInner {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn take_error(&self) -> Option<Error> {
        self.err.lock().unwrap().take()
    }

    fn is_device_gone(&self) -> bool {
        self.state.lock().unwrap().state & DEVICE_GONE != 0
    }

    fn pending_add(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn pending_del(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.wake_drained();
        }
    }

    fn wake_drained(&self) {
        self.drained.notify_waiters();
        self.drained.notify_one();
    }

    /// Store an asynchronous error and wake blocked receivers.
    pub(crate) fn error_report(&self, error: Error) {
        *self.err.lock().unwrap() = Some(error);
        self.rx.wake_all();
    }

    /// The interface device disappeared underneath the endpoint.
    ///
    /// The claim and the instance hold are dropped here; the endpoint
    /// stays on the list so a later release only has to detach.
    pub(crate) fn device_gone(&self, net: &Network) {
        let (name, sa, ifindex) = {
            let mut st = self.state.lock().unwrap();
            if st.state & BOUND == 0 || st.state & DEVICE_GONE != 0 {
                return;
            }
            st.state |= DEVICE_GONE;
            (st.addr.src_name, st.addr.sa, st.ifindex)
        };

        net.ecu().release(name, sa);

        if let Some(stack) = self.stack.upgrade() {
            stack.netdev_stop(ifindex);
        }

        self.wake_drained();
    }

    /// Offer one inbound datagram to this endpoint. Called for every
    /// bound endpoint on the interface, under the registry lock.
    pub(crate) fn recv_one(&self, packet: &Packet) {
        let st = self.state.lock().unwrap();

        if st.state & (BOUND | CONNECTED) == 0 {
            return;
        }

        if st.ifindex != packet.cb.ifindex {
            return;
        }

        if packet.cb.origin == Some(self.id) && st.state & RECV_OWN == 0 {
            return;
        }

        let view = EndpointView {
            addr: &st.addr,
            promisc: st.state & PROMISC != 0,
            connected: st.state & CONNECTED != 0,
            broadcast: st.broadcast,
            pgn_rx_filter: st.pgn_rx_filter,
            filters: st.filters.as_ref(),
        };

        if !filter::accepts(&view, &packet.cb.addr) {
            return;
        }

        let mut flags = MsgFlags::empty();
        if packet.cb.origin.is_some() {
            flags.insert(MsgFlags::DONTROUTE);
        }
        if packet.cb.origin == Some(self.id) {
            flags.insert(MsgFlags::CONFIRM);
        }

        let datagram = Datagram::from_packet(packet, flags);
        drop(st);

        if !self.rx.push(datagram) {
            log::trace!("Receive queue full, datagram dropped");
        }
    }

    fn errqueue(&self, kind: ErrqueueKind, stats: &SessionStats) {
        if self.state.lock().unwrap().state & ERRQUEUE == 0 {
            return;
        }

        if !self.errq.push(Notification::new(kind, stats)) {
            log::debug!("Error queue full, notification dropped");
        }
    }

    /// Detach from the registry and give up the claim and instance hold.
    fn teardown(&self, stack: &Stack) {
        let (net, name, sa, ifindex, bound, gone) = {
            let mut st = self.state.lock().unwrap();
            if st.state & CLOSED != 0 {
                return;
            }
            let bound = st.state & BOUND != 0;
            let gone = st.state & DEVICE_GONE != 0;
            st.state |= CLOSED;
            st.state &= !(BOUND | CONNECTED);

            (
                st.net.take(),
                st.addr.src_name,
                st.addr.sa,
                st.ifindex,
                bound,
                gone,
            )
        };

        if let Some(net) = net {
            if bound {
                net.detach(self.id);

                if !gone {
                    net.ecu().release(name, sa);
                    stack.netdev_stop(ifindex);
                }
            }
        }

        self.rx.wake_all();
    }
}

/// Weak handle on an endpoint, held by the transport engine.
///
/// Sessions outlive single send calls; the engine reports completion and
/// failure through this handle. It never owns the endpoint, and every
/// call degrades to a no-op once the endpoint is gone.
#[derive(Clone)]
pub struct SockRef(Weak<SockInner>);

impl SockRef {
    /// Account one more outbound buffer owned by the engine.
    pub fn pending_add(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.pending_add();
        }
    }

    /// Release one outbound buffer; the last one wakes the drain waiter.
    pub fn pending_del(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.pending_del();
        }
    }

    /// Queue an error-queue notification, if the endpoint opted in.
    pub fn errqueue(&self, kind: ErrqueueKind, stats: &SessionStats) {
        if let Some(inner) = self.0.upgrade() {
            inner.errqueue(kind, stats);
        }
    }

    /// Post an asynchronous error and wake blocked callers.
    pub fn send_multi_abort(&self, error: Error) {
        if let Some(inner) = self.0.upgrade() {
            inner.error_report(error);
        }
    }
}

/// A J1939 datagram endpoint.
///
/// Endpoints are connectionless; bind assigns the local identity on an
/// interface, connect merely stores the default peer. Payloads of at
/// most 8 bytes leave as a single frame, anything larger is segmented
/// into a transport session.
pub struct Socket {
    inner: Arc<SockInner>,
    stack: Arc<Stack>,
}

impl Socket {
    /// Create an unbound endpoint on the stack.
    pub fn open(stack: &Arc<Stack>) -> Self {
        let config = stack.config();

        Self {
            inner: Arc::new(SockInner {
                id: SOCK_ID.fetch_add(1, Ordering::Relaxed),
                stack: Arc::downgrade(stack),
                op: tokio::sync::Mutex::new(()),
                state: Mutex::new(SockState {
                    state: 0,
                    ifindex: 0,
                    addr: Addr::default(),
                    pgn_rx_filter: Pgn::NONE,
                    filters: Vec::new().into(),
                    generic_priority: to_generic_priority(6),
                    broadcast: false,
                    tx_complete_size: 0,
                    tx_done_size: 0,
                    net: None,
                }),
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
                rx: RecvQueue::new(config.recv_queue_depth),
                errq: RecvQueue::new(config.errqueue_depth),
                err: Mutex::new(None),
            }),
            stack: stack.clone(),
        }
    }

    /// Engine-side handle on this endpoint.
    pub fn handle(&self) -> SockRef {
        SockRef(Arc::downgrade(&self.inner))
    }

    fn sanity_check(addr: &SockAddrJ1939) -> Result<(), Error> {
        if addr.ifindex == 0 {
            return Err(Error::NoSuchDevice);
        }
        if addr.pgn.is_valid() && !addr.pgn.is_clean_pdu() {
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }

    /// Assign the local identity and attach to the interface.
    ///
    /// The interface is fixed by the first successful bind; binding again
    /// on the same interface replaces the local identity.
    pub async fn bind(&self, addr: &SockAddrJ1939) -> Result<(), Error> {
        Self::sanity_check(addr)?;

        let _guard = self.inner.op.lock().await;

        let device = self
            .stack
            .resolve_device(addr.ifindex)
            .ok_or(Error::NoSuchDevice)?;

        let (bound, old_name, old_sa, cur_net) = {
            let st = self.inner.state.lock().unwrap();

            if st.state & (CLOSED | DEVICE_GONE) != 0 {
                return Err(Error::BadState);
            }

            if st.state & BOUND != 0 && st.ifindex != addr.ifindex {
                return Err(Error::InvalidArgument);
            }

            (
                st.state & BOUND != 0,
                st.addr.src_name,
                st.addr.sa,
                st.net.clone(),
            )
        };

        let net = if bound {
            // Rebind on the same interface: the previous identity goes.
            let net = cur_net.ok_or(Error::BadState)?;
            net.ecu().release(old_name, old_sa);
            net
        } else {
            if !device.is_can() {
                return Err(Error::NoSuchDevice);
            }
            self.stack.netdev_start(device)
        };

        {
            let mut st = self.inner.state.lock().unwrap();
            st.ifindex = addr.ifindex;
            if addr.pgn.is_valid() {
                st.pgn_rx_filter = addr.pgn;
            }
            st.addr.src_name = addr.name;
            st.addr.sa = addr.addr;
        }

        if let Err(error) = net.ecu().claim(addr.name, addr.addr) {
            if bound {
                // The old identity is already gone and the new one is
                // refused; the endpoint falls back to unbound.
                net.detach(self.inner.id);
                {
                    let mut st = self.inner.state.lock().unwrap();
                    st.state &= !(BOUND | CONNECTED);
                    st.net = None;
                }
            }
            self.stack.netdev_stop(addr.ifindex);

            return Err(error);
        }

        if !bound {
            {
                let mut st = self.inner.state.lock().unwrap();
                st.net = Some(net.clone());
                st.state |= BOUND;
            }
            net.attach(self.inner.clone());
        }

        Ok(())
    }

    /// Store the default peer for subsequent sends and constrain
    /// reception to it.
    pub async fn connect(&self, addr: &SockAddrJ1939) -> Result<(), Error> {
        Self::sanity_check(addr)?;

        let _guard = self.inner.op.lock().await;
        let mut st = self.inner.state.lock().unwrap();

        if st.state & BOUND == 0 {
            return Err(Error::InvalidArgument);
        }

        if st.ifindex != addr.ifindex {
            return Err(Error::InvalidArgument);
        }

        if addr.name == NO_NAME
            && (addr.addr == NO_ADDR || addr.addr == BROADCAST_ADDR)
            && !st.broadcast
        {
            return Err(Error::AccessDenied);
        }

        st.addr.dst_name = addr.name;
        st.addr.da = addr.addr;
        if addr.pgn.is_valid() {
            st.addr.pgn = addr.pgn;
        }

        st.state |= CONNECTED;

        Ok(())
    }

    /// The local side of the endpoint address.
    pub fn local_addr(&self) -> SockAddrJ1939 {
        let st = self.inner.state.lock().unwrap();

        SockAddrJ1939 {
            ifindex: st.ifindex,
            name: st.addr.src_name,
            pgn: st.addr.pgn,
            addr: st.addr.sa,
        }
    }

    /// The peer side of the endpoint address.
    pub fn peer_addr(&self) -> Result<SockAddrJ1939, Error> {
        let st = self.inner.state.lock().unwrap();

        if st.state & CONNECTED == 0 {
            return Err(Error::AddressNotAvailable);
        }

        Ok(SockAddrJ1939 {
            ifindex: st.ifindex,
            name: st.addr.dst_name,
            pgn: st.addr.pgn,
            addr: st.addr.da,
        })
    }

    /// Replace the receive filter list as a whole.
    pub fn set_filters(&self, filters: Vec<Filter>) -> Result<(), Error> {
        if filters.len() > self.stack.config().filter_max {
            return Err(Error::InvalidArgument);
        }

        let filters: Arc<[Filter]> = filters
            .into_iter()
            .map(Filter::normalized)
            .collect::<Vec<_>>()
            .into();

        self.inner.state.lock().unwrap().filters = filters;

        Ok(())
    }

    /// Take every frame on the interface, regardless of addressing.
    pub fn set_promisc(&self, on: bool) {
        self.set_flag(PROMISC, on);
    }

    pub fn promisc(&self) -> bool {
        self.flag(PROMISC)
    }

    /// Deliver this endpoint's own transmissions back to it.
    pub fn set_recv_own(&self, on: bool) {
        self.set_flag(RECV_OWN, on);
    }

    pub fn recv_own(&self) -> bool {
        self.flag(RECV_OWN)
    }

    /// Opt in to session notifications; opting out purges the queue.
    pub fn set_errqueue(&self, on: bool) {
        self.set_flag(ERRQUEUE, on);
        if !on {
            self.inner.errq.purge();
        }
    }

    pub fn errqueue(&self) -> bool {
        self.flag(ERRQUEUE)
    }

    /// Permit sending to the broadcast address.
    pub fn set_broadcast(&self, on: bool) {
        self.inner.state.lock().unwrap().broadcast = on;
    }

    pub fn broadcast(&self) -> bool {
        self.inner.state.lock().unwrap().broadcast
    }

    /// Set the send priority, 0 the most urgent. Priorities below 2 are
    /// reserved to privileged stacks.
    pub fn set_send_priority(&self, priority: u8) -> Result<(), Error> {
        if priority > 7 {
            return Err(Error::OutOfDomain);
        }
        if priority < 2 && !self.stack.config().admin {
            return Err(Error::PermissionDenied);
        }

        self.inner.state.lock().unwrap().generic_priority = to_generic_priority(priority);

        Ok(())
    }

    pub fn send_priority(&self) -> u8 {
        from_generic_priority(self.inner.state.lock().unwrap().generic_priority)
    }

    fn set_flag(&self, flag: u32, on: bool) {
        let mut st = self.inner.state.lock().unwrap();
        if on {
            st.state |= flag;
        } else {
            st.state &= !flag;
        }
    }

    fn flag(&self, flag: u32) -> bool {
        self.inner.state.lock().unwrap().state & flag != 0
    }

    /// Take the stored asynchronous error, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.inner.take_error()
    }

    /// Receive the next datagram, waiting for one to arrive.
    pub async fn recv(&self) -> Result<Datagram, Error> {
        loop {
            if let Some(error) = self.inner.take_error() {
                return Err(error);
            }

            let parked = self.inner.rx.notified();

            if let Some(datagram) = self.inner.rx.try_pop() {
                return Ok(datagram);
            }

            if self.flag(CLOSED) {
                return Err(Error::BadState);
            }

            parked.await;
        }
    }

    /// Receive the next datagram without waiting.
    pub fn try_recv(&self) -> Result<Datagram, Error> {
        if let Some(error) = self.inner.take_error() {
            return Err(error);
        }

        self.inner.rx.try_pop().ok_or(Error::WouldBlock)
    }

    /// Drain the next error-queue notification.
    pub fn recv_error(&self) -> Result<Notification, Error> {
        self.inner.errq.try_pop().ok_or(Error::WouldBlock)
    }

    /// Send to the connected peer.
    pub async fn send(&self, buf: &[u8]) -> Result<usize, Error> {
        self.sendmsg(buf, None).await
    }

    /// Send to an explicit destination.
    pub async fn send_to(&self, buf: &[u8], addr: &SockAddrJ1939) -> Result<usize, Error> {
        self.sendmsg(buf, Some(addr)).await
    }

    async fn sendmsg(&self, buf: &[u8], dest: Option<&SockAddrJ1939>) -> Result<usize, Error> {
        let _guard = self.inner.op.lock().await;

        if let Some(error) = self.inner.take_error() {
            return Err(error);
        }

        let (cb, net) = {
            let st = self.inner.state.lock().unwrap();

            if st.state & CLOSED != 0 || st.state & BOUND == 0 {
                return Err(Error::BadState);
            }
            if st.state & DEVICE_GONE != 0 {
                return Err(Error::NoSuchDevice);
            }
            if st.addr.src_name == NO_NAME && st.addr.sa == NO_ADDR {
                // No source identity assigned yet.
                return Err(Error::BadState);
            }

            let mut addr = st.addr;

            if let Some(dest) = dest {
                if dest.ifindex != 0 && dest.ifindex != st.ifindex {
                    return Err(Error::BadState);
                }
                if dest.pgn.is_valid() && !dest.pgn.is_clean_pdu() {
                    return Err(Error::InvalidArgument);
                }

                if dest.name != NO_NAME || dest.addr != NO_ADDR {
                    addr.dst_name = dest.name;
                    addr.da = dest.addr;
                }
                if dest.pgn.is_valid() {
                    addr.pgn = dest.pgn;
                }
            } else if st.state & CONNECTED == 0 {
                return Err(Error::DestinationRequired);
            }

            if addr.dst_name == NO_NAME
                && (addr.da == NO_ADDR || addr.da == BROADCAST_ADDR)
                && !st.broadcast
            {
                // The resolved target is the broadcast.
                return Err(Error::AccessDenied);
            }

            if !addr.pgn.is_valid() {
                return Err(Error::InvalidArgument);
            }

            let net = st.net.clone().ok_or(Error::BadState)?;

            (
                PacketCb {
                    addr,
                    priority: from_generic_priority(st.generic_priority),
                    flags: MsgFlags::empty(),
                    offset: 0,
                    origin: Some(self.inner.id),
                    ifindex: st.ifindex,
                },
                net,
            )
        };

        if buf.len() <= 8 {
            self.send_one(&net, cb, buf)
        } else if buf.len() <= MAX_ETP_PACKET_SIZE {
            self.send_multi(&net, cb, buf)
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Single-frame path.
    fn send_one(&self, net: &Network, cb: PacketCb, buf: &[u8]) -> Result<usize, Error> {
        let packet = Packet {
            data: Bytes::copy_from_slice(buf),
            cb,
        };

        net.send_one(&packet)?;

        Ok(buf.len())
    }

    /// Segmented path through the transport engine.
    ///
    /// One multi-frame datagram may be in flight per endpoint. A send
    /// cut short by the engine reports the bytes it queued; the caller
    /// retries with exactly the remainder, anything else is refused.
    fn send_multi(&self, net: &Arc<Network>, cb: PacketCb, buf: &[u8]) -> Result<usize, Error> {
        let size = buf.len();

        let (first_of_datagram, complete_size, start_done) = {
            let mut st = self.inner.state.lock().unwrap();

            if st.tx_done_size == 0 {
                self.inner.pending_add();
                st.tx_complete_size = size;
                (true, size, 0)
            } else if st.tx_complete_size != st.tx_done_size + size {
                return Err(Error::InputOutput);
            } else {
                (false, st.tx_complete_size, st.tx_done_size)
            }
        };

        let mut todo = size;
        let mut done = start_done;
        let mut session: Option<SessionId> = None;
        let mut outcome = Ok(());

        while todo > 0 {
            let segment_size = todo.min(MAX_TP_PACKET_SIZE);

            let mut segment_cb = cb.clone();
            segment_cb.offset = done;

            let packet = Packet {
                data: Bytes::copy_from_slice(&buf[size - todo..size - todo + segment_size]),
                cb: segment_cb,
            };

            let step = if let Some(session) = session {
                net.engine().session_queue(session, packet)
            } else if done > 0 {
                // Continuation of an earlier call; find its session.
                match net
                    .engine()
                    .session_get(&packet.cb, SessionKind::for_size(complete_size))
                {
                    Ok(found) => {
                        session = Some(found);
                        net.engine().session_queue(found, packet)
                    }
                    Err(error) => Err(error),
                }
            } else {
                match net
                    .engine()
                    .tp_send(SockRef(Arc::downgrade(&self.inner)), packet, complete_size)
                {
                    Ok(created) => {
                        session = Some(created);
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            };

            if let Err(error) = step {
                outcome = Err(error);
                break;
            }

            todo -= segment_size;
            done += segment_size;
        }

        let result = match outcome {
            Ok(()) => {
                self.inner.state.lock().unwrap().tx_done_size = 0;
                Ok(size)
            }
            Err(error @ (Error::WouldBlock | Error::Interrupted)) => {
                self.inner.state.lock().unwrap().tx_done_size = done;

                if todo != size {
                    Ok(size - todo)
                } else {
                    if first_of_datagram && session.is_none() {
                        // Nothing reached the engine.
                        self.inner.pending_del();
                    }
                    Err(error)
                }
            }
            Err(error) => {
                self.inner.state.lock().unwrap().tx_done_size = 0;

                if first_of_datagram && session.is_none() {
                    self.inner.pending_del();
                }

                Err(error)
            }
        };

        if let Some(session) = session {
            net.engine().session_put(session);
        }

        result
    }

    /// Release the endpoint.
    ///
    /// Waits until the transport engine has let go of every outbound
    /// buffer, then detaches from the interface. Dropping the socket
    /// without closing performs the same teardown without the wait.
    pub async fn close(&self) {
        let _guard = self.inner.op.lock().await;

        let bound = {
            let st = self.inner.state.lock().unwrap();
            if st.state & CLOSED != 0 {
                return;
            }
            st.state & BOUND != 0 && st.state & DEVICE_GONE == 0
        };

        if bound {
            loop {
                let parked = self.inner.drained.notified();

                if self.inner.pending.load(Ordering::Acquire) == 0 {
                    break;
                }
                if self.inner.is_device_gone() {
                    break;
                }

                parked.await;
            }
        }

        self.inner.teardown(&self.stack);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.inner.pending.load(Ordering::Acquire) != 0 {
            log::warn!("Endpoint dropped with outbound segments pending");
        }

        self.inner.teardown(&self.stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CanDevice, StaticDevices, Vcan};
    use crate::errqueue::{ErrInfo, ErrOrigin};
    use crate::transport::TransportEngine;
    use crate::StackConfig;
    use j1939::Frame;

    #[derive(Default)]
    struct EngineState {
        next: u64,
        sessions: Vec<MockSession>,
        budget: Option<usize>,
    }

    struct MockSession {
        id: SessionId,
        sock: Option<SockRef>,
        total: usize,
        segments: Vec<Packet>,
    }

    /// Records sessions and segments; an optional budget limits how many
    /// segments are taken before the engine pushes back.
    #[derive(Default)]
    struct MockEngine {
        state: Mutex<EngineState>,
    }

    impl MockEngine {
        fn set_budget(&self, budget: Option<usize>) {
            self.state.lock().unwrap().budget = budget;
        }

        fn take_budget(state: &mut EngineState) -> bool {
            match state.budget {
                Some(0) => false,
                Some(ref mut n) => {
                    *n -= 1;
                    true
                }
                None => true,
            }
        }

        fn session_count(&self) -> usize {
            self.state.lock().unwrap().sessions.len()
        }

        fn session_bytes(&self, index: usize) -> usize {
            self.state.lock().unwrap().sessions[index]
                .segments
                .iter()
                .map(|p| p.data.len())
                .sum()
        }

        fn session_total(&self, index: usize) -> usize {
            self.state.lock().unwrap().sessions[index].total
        }

        /// Emulate the engine finishing a session.
        fn complete(&self, index: usize) {
            let sock = self.state.lock().unwrap().sessions[index].sock.clone();
            if let Some(sock) = sock {
                sock.pending_del();
            }
        }
    }

    impl TransportEngine for MockEngine {
        fn tp_send(
            &self,
            sock: SockRef,
            packet: Packet,
            total_size: usize,
        ) -> Result<SessionId, Error> {
            let mut state = self.state.lock().unwrap();

            if !Self::take_budget(&mut state) {
                return Err(Error::WouldBlock);
            }

            state.next += 1;
            let id = SessionId(state.next);

            state.sessions.push(MockSession {
                id,
                sock: Some(sock),
                total: total_size,
                segments: vec![packet],
            });

            Ok(id)
        }

        fn session_get(&self, cb: &PacketCb, _kind: SessionKind) -> Result<SessionId, Error> {
            self.state
                .lock()
                .unwrap()
                .sessions
                .iter()
                .rev()
                .find(|s| {
                    let first = &s.segments[0].cb;
                    first.ifindex == cb.ifindex
                        && first.addr.sa == cb.addr.sa
                        && first.addr.da == cb.addr.da
                        && first.addr.pgn == cb.addr.pgn
                })
                .map(|s| s.id)
                .ok_or(Error::NotFound)
        }

        fn session_queue(&self, session: SessionId, packet: Packet) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();

            if !Self::take_budget(&mut state) {
                return Err(Error::WouldBlock);
            }

            state
                .sessions
                .iter_mut()
                .find(|s| s.id == session)
                .ok_or(Error::NotFound)?
                .segments
                .push(packet);

            Ok(())
        }

        fn session_put(&self, _session: SessionId) {}
    }

    struct NotCan;

    impl CanDevice for NotCan {
        fn index(&self) -> u32 {
            9
        }

        fn name(&self) -> &str {
            "eth0"
        }

        fn is_can(&self) -> bool {
            false
        }

        fn transmit(&self, _frame: &Frame) -> Result<(), Error> {
            Err(Error::NoSuchDevice)
        }
    }

    struct TestBed {
        stack: Arc<Stack>,
        device: Arc<Vcan>,
        engine: Arc<MockEngine>,
    }

    fn testbed() -> TestBed {
        testbed_with(StackConfig::default())
    }

    fn testbed_with(config: StackConfig) -> TestBed {
        let devices = Arc::new(StaticDevices::new());
        let device = Arc::new(Vcan::new(1, "vcan0"));
        devices.insert(device.clone());
        devices.insert(Arc::new(Vcan::new(2, "vcan1")));
        devices.insert(Arc::new(NotCan));

        let engine = Arc::new(MockEngine::default());
        let stack = Stack::with_config(devices, engine.clone(), config);

        TestBed {
            stack,
            device,
            engine,
        }
    }

    fn bind_addr(ifindex: u32, addr: u8) -> SockAddrJ1939 {
        SockAddrJ1939::new(ifindex).with_addr(addr)
    }

    fn send_addr(addr: u8, pgn: u32) -> SockAddrJ1939 {
        SockAddrJ1939::new(0).with_addr(addr).with_pgn(Pgn::new(pgn))
    }

    #[tokio::test]
    async fn single_frame_unicast() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        let b = Socket::open(&bed.stack);

        a.bind(&bind_addr(1, 0x10)).await.unwrap();
        b.bind(&bind_addr(1, 0x20)).await.unwrap();

        let sent = a
            .send_to(&[1, 2, 3, 4, 5, 6], &send_addr(0x20, 0x1F004))
            .await
            .unwrap();
        assert_eq!(sent, 6);

        let datagram = b.recv().await.unwrap();
        assert_eq!(datagram.data.as_ref(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(datagram.source.addr, 0x10);
        assert_eq!(datagram.source.pgn, Pgn::new(0x1F004));
        assert!(datagram.flags.contains(MsgFlags::DONTROUTE));
        assert!(!datagram.flags.contains(MsgFlags::CONFIRM));

        let frames = bed.device.sent();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id().pgn(), Pgn::new(0x1F004));
        assert_eq!(frames[0].id().source_address(), 0x10);
    }

    #[tokio::test]
    async fn broadcast_gate() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        assert_eq!(
            a.send_to(&[0xAA], &send_addr(BROADCAST_ADDR, 0x1F004)).await,
            Err(Error::AccessDenied)
        );

        a.set_broadcast(true);
        assert_eq!(
            a.send_to(&[0xAA], &send_addr(BROADCAST_ADDR, 0x1F004)).await,
            Ok(1)
        );
    }

    #[tokio::test]
    async fn filter_mask_delivery() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        let b = Socket::open(&bed.stack);

        a.bind(&bind_addr(1, 0x10)).await.unwrap();
        b.bind(&bind_addr(1, 0x20)).await.unwrap();

        b.set_filters(vec![Filter {
            pgn: 0x1F000,
            pgn_mask: 0x1FF00,
            ..Default::default()
        }])
        .unwrap();

        a.send_to(&[1], &send_addr(0x20, 0x1F0A5)).await.unwrap();
        assert_eq!(b.try_recv().unwrap().source.pgn, Pgn::new(0x1F0A5));

        a.send_to(&[2], &send_addr(0x20, 0x1E0A5)).await.unwrap();
        assert_eq!(b.try_recv().unwrap_err(), Error::WouldBlock);
    }

    #[tokio::test]
    async fn eight_bytes_single_nine_bytes_segmented() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        a.send_to(&[0; 8], &send_addr(0x20, 0x1F004)).await.unwrap();
        assert_eq!(bed.device.sent().len(), 1);
        assert_eq!(bed.engine.session_count(), 0);

        a.send_to(&[0; 9], &send_addr(0x20, 0x1F004)).await.unwrap();
        assert_eq!(bed.device.sent().len(), 1);
        assert_eq!(bed.engine.session_count(), 1);
        assert_eq!(bed.engine.session_total(0), 9);
        assert_eq!(bed.engine.session_bytes(0), 9);
    }

    #[tokio::test]
    async fn segmented_send_with_partial_progress() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        let payload = vec![0x5A; 4000];

        // The engine takes the first segment, then pushes back.
        bed.engine.set_budget(Some(1));
        let queued = a
            .send_to(&payload, &send_addr(0x20, 0x1F004))
            .await
            .unwrap();
        assert_eq!(queued, MAX_TP_PACKET_SIZE);

        // Retry with exactly the remainder.
        bed.engine.set_budget(None);
        let queued = a
            .send_to(&payload[MAX_TP_PACKET_SIZE..], &send_addr(0x20, 0x1F004))
            .await
            .unwrap();
        assert_eq!(queued, 4000 - MAX_TP_PACKET_SIZE);

        assert_eq!(bed.engine.session_count(), 1);
        assert_eq!(bed.engine.session_total(0), 4000);
        assert_eq!(bed.engine.session_bytes(0), 4000);

        // The next datagram starts from scratch.
        assert_eq!(a.inner.state.lock().unwrap().tx_done_size, 0);
    }

    #[tokio::test]
    async fn continuation_size_mismatch() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        let payload = vec![0x5A; 4000];

        bed.engine.set_budget(Some(1));
        a.send_to(&payload, &send_addr(0x20, 0x1F004)).await.unwrap();

        bed.engine.set_budget(None);
        assert_eq!(
            a.send_to(&payload[..1000], &send_addr(0x20, 0x1F004)).await,
            Err(Error::InputOutput)
        );
    }

    #[tokio::test]
    async fn segmented_send_refused_outright() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        bed.engine.set_budget(Some(0));
        assert_eq!(
            a.send_to(&[0; 100], &send_addr(0x20, 0x1F004)).await,
            Err(Error::WouldBlock)
        );

        // Nothing reached the engine, nothing stays pending.
        assert_eq!(bed.engine.session_count(), 0);
        assert_eq!(a.inner.pending.load(Ordering::Acquire), 0);
        assert_eq!(a.inner.state.lock().unwrap().tx_done_size, 0);
    }

    #[tokio::test]
    async fn release_drains_pending_segments() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        let handle = a.handle();
        handle.pending_add();
        handle.pending_add();
        handle.pending_add();

        let close = a.close();
        tokio::pin!(close);

        let wait = tokio::time::timeout(std::time::Duration::from_millis(50), close.as_mut());
        assert!(wait.await.is_err());

        handle.pending_del();
        handle.pending_del();
        handle.pending_del();

        close.await;

        let net = bed.stack.network(1);
        assert!(net.is_none());
    }

    #[tokio::test]
    async fn recv_own_echo() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        a.send_to(&[0x11], &send_addr(0x10, 0x1F004)).await.unwrap();
        assert_eq!(a.try_recv().unwrap_err(), Error::WouldBlock);

        a.set_recv_own(true);
        a.send_to(&[0x22], &send_addr(0x10, 0x1F004)).await.unwrap();

        let datagram = a.try_recv().unwrap();
        assert_eq!(datagram.data.as_ref(), &[0x22]);
        assert!(datagram.flags.contains(MsgFlags::CONFIRM));
        assert!(datagram.flags.contains(MsgFlags::DONTROUTE));
    }

    #[tokio::test]
    async fn promisc_toggle() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        let b = Socket::open(&bed.stack);

        a.bind(&bind_addr(1, 0x10)).await.unwrap();
        b.bind(&bind_addr(1, 0x20)).await.unwrap();

        a.send_to(&[1], &send_addr(0x30, 0x1F004)).await.unwrap();
        assert_eq!(b.try_recv().unwrap_err(), Error::WouldBlock);

        b.set_promisc(true);
        a.send_to(&[2], &send_addr(0x30, 0x1F004)).await.unwrap();
        assert_eq!(b.try_recv().unwrap().data.as_ref(), &[2]);

        b.set_promisc(false);
        a.send_to(&[3], &send_addr(0x30, 0x1F004)).await.unwrap();
        assert_eq!(b.try_recv().unwrap_err(), Error::WouldBlock);
    }

    #[tokio::test]
    async fn bind_to_non_can_device() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        assert_eq!(a.bind(&bind_addr(9, 0x10)).await, Err(Error::NoSuchDevice));
        assert_eq!(a.bind(&bind_addr(77, 0x10)).await, Err(Error::NoSuchDevice));
    }

    #[tokio::test]
    async fn rebind_same_interface_replaces_identity() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        let net = bed.stack.network(1).unwrap();
        assert_eq!(net.ecu().users(NO_NAME, 0x10), 1);

        a.bind(&bind_addr(1, 0x11)).await.unwrap();
        assert_eq!(net.ecu().users(NO_NAME, 0x10), 0);
        assert_eq!(net.ecu().users(NO_NAME, 0x11), 1);
        assert_eq!(net.endpoints(), 1);

        assert_eq!(a.bind(&bind_addr(2, 0x12)).await, Err(Error::InvalidArgument));
    }

    #[tokio::test]
    async fn bind_rejects_unclean_pdu1() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        let addr = SockAddrJ1939::new(1).with_addr(0x10).with_pgn(Pgn::new(0xEA05));

        assert_eq!(a.bind(&addr).await, Err(Error::InvalidArgument));
    }

    #[tokio::test]
    async fn connect_requires_bind() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        assert_eq!(
            a.connect(&bind_addr(1, 0x20)).await,
            Err(Error::InvalidArgument)
        );
    }

    #[tokio::test]
    async fn connect_broadcast_gate() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        assert_eq!(
            a.connect(&SockAddrJ1939::new(1)).await,
            Err(Error::AccessDenied)
        );

        a.set_broadcast(true);
        a.connect(&SockAddrJ1939::new(1)).await.unwrap();
    }

    #[tokio::test]
    async fn getname_roundtrip() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);

        assert_eq!(a.peer_addr(), Err(Error::AddressNotAvailable));

        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        let local = a.local_addr();
        assert_eq!(local.ifindex, 1);
        assert_eq!(local.addr, 0x10);
        assert_eq!(local.name, NO_NAME);

        assert_eq!(a.peer_addr(), Err(Error::AddressNotAvailable));

        let peer = SockAddrJ1939::new(1).with_addr(0x20).with_pgn(Pgn::new(0x1F004));
        a.connect(&peer).await.unwrap();

        let resolved = a.peer_addr().unwrap();
        assert_eq!(resolved.addr, 0x20);
        assert_eq!(resolved.pgn, Pgn::new(0x1F004));
    }

    #[tokio::test]
    async fn connected_send_and_source_filter() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        let b = Socket::open(&bed.stack);
        let c = Socket::open(&bed.stack);

        a.bind(&bind_addr(1, 0x10)).await.unwrap();
        b.bind(&bind_addr(1, 0x20)).await.unwrap();
        c.bind(&bind_addr(1, 0x30)).await.unwrap();

        b.connect(&SockAddrJ1939::new(1).with_addr(0x10).with_pgn(Pgn::new(0x1F004)))
            .await
            .unwrap();

        // Send without a destination goes to the connected peer.
        b.send(&[0xB0]).await.unwrap();
        assert_eq!(a.try_recv().unwrap().data.as_ref(), &[0xB0]);

        // Traffic from anyone but the peer is filtered out.
        c.send_to(&[0xC0], &send_addr(0x20, 0x1F004)).await.unwrap();
        assert_eq!(b.try_recv().unwrap_err(), Error::WouldBlock);

        a.send_to(&[0xA0], &send_addr(0x20, 0x1F004)).await.unwrap();
        assert_eq!(b.try_recv().unwrap().data.as_ref(), &[0xA0]);
    }

    #[tokio::test]
    async fn send_before_bind() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        assert_eq!(
            a.send_to(&[1], &send_addr(0x20, 0x1F004)).await,
            Err(Error::BadState)
        );
    }

    #[tokio::test]
    async fn send_without_destination_or_peer() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        assert_eq!(a.send(&[1]).await, Err(Error::DestinationRequired));
    }

    #[tokio::test]
    async fn send_priority_surface() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        assert_eq!(a.send_priority(), 6);
        assert_eq!(a.set_send_priority(8), Err(Error::OutOfDomain));
        assert_eq!(a.set_send_priority(1), Err(Error::PermissionDenied));

        a.set_send_priority(3).unwrap();
        assert_eq!(a.send_priority(), 3);

        a.send_to(&[1], &send_addr(0x20, 0x1F004)).await.unwrap();
        assert_eq!(bed.device.sent()[0].id().priority(), 3);
    }

    #[tokio::test]
    async fn send_priority_privileged() {
        let bed = testbed_with(StackConfig {
            admin: true,
            ..Default::default()
        });

        let a = Socket::open(&bed.stack);
        a.set_send_priority(0).unwrap();
        assert_eq!(a.send_priority(), 0);
    }

    #[tokio::test]
    async fn filter_list_cap() {
        let bed = testbed_with(StackConfig {
            filter_max: 2,
            ..Default::default()
        });

        let a = Socket::open(&bed.stack);
        assert_eq!(
            a.set_filters(vec![Filter::default(); 3]),
            Err(Error::InvalidArgument)
        );
        a.set_filters(vec![Filter::default(); 2]).unwrap();
    }

    #[tokio::test]
    async fn errqueue_notifications() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        let stats = SessionStats {
            pkt_done: 2,
            total_message_size: 100,
            err: None,
            tskey: 5,
        };

        // Not opted in: nothing is queued.
        a.handle().errqueue(ErrqueueKind::Ack, &stats);
        assert_eq!(a.recv_error().unwrap_err(), Error::WouldBlock);

        a.set_errqueue(true);
        a.handle().errqueue(ErrqueueKind::Ack, &stats);

        let notification = a.recv_error().unwrap();
        assert_eq!(notification.error, Error::NoMessage);
        assert_eq!(notification.origin, ErrOrigin::Timestamping);
        assert_eq!(notification.info, ErrInfo::TstampAck);
        assert_eq!(notification.tskey, 5);
        assert_eq!(notification.stats.bytes_acked, 14);

        // Opting out purges anything still queued.
        a.handle().errqueue(ErrqueueKind::Sched, &stats);
        a.set_errqueue(false);
        assert_eq!(a.recv_error().unwrap_err(), Error::WouldBlock);
    }

    #[tokio::test]
    async fn multi_abort_wakes_sender() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        a.handle().send_multi_abort(Error::InputOutput);

        assert_eq!(
            a.send_to(&[1], &send_addr(0x20, 0x1F004)).await,
            Err(Error::InputOutput)
        );

        // The error surfaces exactly once.
        assert_eq!(
            a.send_to(&[1], &send_addr(0x20, 0x1F004)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn bound_endpoint_registered_exactly_once() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        let b = Socket::open(&bed.stack);

        a.bind(&bind_addr(1, 0x10)).await.unwrap();
        b.bind(&bind_addr(1, 0x20)).await.unwrap();

        let net = bed.stack.network(1).unwrap();
        assert_eq!(net.endpoints(), 2);
        assert_eq!(bed.stack.holders(1), 2);
        assert_eq!(net.ecu().users(NO_NAME, 0x10), 1);

        a.close().await;
        assert_eq!(net.endpoints(), 1);
        assert_eq!(net.ecu().users(NO_NAME, 0x10), 0);
        assert_eq!(bed.stack.holders(1), 1);

        b.close().await;
        assert!(bed.stack.network(1).is_none());
    }

    #[tokio::test]
    async fn closed_endpoint_refuses_operations() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();
        a.close().await;

        assert_eq!(
            a.send_to(&[1], &send_addr(0x20, 0x1F004)).await,
            Err(Error::BadState)
        );
        assert_eq!(a.recv().await.unwrap_err(), Error::BadState);
    }

    #[tokio::test]
    async fn device_gone_is_terminal() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();

        let net = bed.stack.network(1).unwrap();

        // Engine still holds a segment when the device disappears.
        a.handle().pending_add();

        bed.stack.netdev_event(1, Error::NoSuchDevice);

        assert_eq!(net.ecu().users(NO_NAME, 0x10), 0);
        assert!(bed.stack.network(1).is_none());

        // The stored error surfaces on the next receive.
        assert_eq!(a.try_recv().unwrap_err(), Error::NoSuchDevice);

        assert_eq!(
            a.send_to(&[1], &send_addr(0x20, 0x1F004)).await,
            Err(Error::NoSuchDevice)
        );

        // Release does not wait on the dead engine.
        tokio::time::timeout(std::time::Duration::from_millis(50), a.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn engine_completion_reaches_errqueue() {
        let bed = testbed();

        let a = Socket::open(&bed.stack);
        a.bind(&bind_addr(1, 0x10)).await.unwrap();
        a.set_errqueue(true);

        a.send_to(&vec![0; 64], &send_addr(0x20, 0x1F004))
            .await
            .unwrap();

        assert_eq!(a.inner.pending.load(Ordering::Acquire), 1);

        let stats = SessionStats {
            pkt_done: 10,
            total_message_size: 64,
            err: None,
            tskey: 0,
        };
        a.handle().errqueue(ErrqueueKind::Ack, &stats);
        bed.engine.complete(0);

        assert_eq!(a.inner.pending.load(Ordering::Acquire), 0);
        assert_eq!(a.recv_error().unwrap().stats.bytes_acked, 64);
    }
}
