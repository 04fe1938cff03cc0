//! Per-socket state: the fixed-size socket table, its 256-byte ring
//! buffers, and the BSD-style address/protocol types (§3 "Socket", §4.4).

use core::fmt::Write as _;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::Duration;

use crate::error::Error;

pub const RING_CAPACITY: usize = 256;
pub const MAX_SOCKETS: usize = 6;

/// Default `SO_RCVTIMEO`, and the ceiling `setsockopt` clamps to (§4.4).
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Index into the socket table; equal to the modem's own socket id (§3).
pub type SocketHandle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    Tcp = 6,
    Udp = 17,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketAddrV4 {
    pub ip: [u8; 4],
    pub port: u16,
}

impl SocketAddrV4 {
    pub const fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip, port }
    }

    /// Renders `a.b.c.d` for embedding in an AT command argument list.
    pub fn ip_to_heapless(&self) -> heapless::String<16> {
        let mut out = heapless::String::new();
        let [a, b, c, d] = self.ip;
        let _ = write!(out, "{a}.{b}.{c}.{d}");
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectState {
    Idle,
    Connected,
    Failed,
}

/// Fixed-capacity FIFO byte queue with wraparound (§3 invariant 3: `0 <=
/// length <= capacity`, `head` always in `[0, capacity)`).
pub(crate) struct RingBuffer {
    data: [u8; RING_CAPACITY],
    head: usize,
    len: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self { data: [0u8; RING_CAPACITY], head: 0, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Appends as many bytes as fit; extra bytes beyond remaining capacity
    /// are dropped (the modem-side flow control above this layer is
    /// expected to never advertise more than the ring can hold in one go).
    fn push_slice(&mut self, bytes: &[u8]) -> usize {
        let room = RING_CAPACITY - self.len;
        let n = bytes.len().min(room);
        let tail = (self.head + self.len) % RING_CAPACITY;
        for (i, &b) in bytes[..n].iter().enumerate() {
            self.data[(tail + i) % RING_CAPACITY] = b;
        }
        self.len += n;
        n
    }

    /// Drains up to `out.len()` bytes, oldest first.
    fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.data[(self.head + i) % RING_CAPACITY];
        }
        self.head = (self.head + n) % RING_CAPACITY;
        self.len -= n;
        n
    }
}

struct SocketRecord {
    acquired: bool,
    protocol: Protocol,
    secure: bool,
    connect_state: ConnectState,
    bound: bool,
    to_be_closed: bool,
    non_blocking: bool,
    recv_timeout: Duration,
    ring: RingBuffer,
    /// Last peer address from `connect`/`sendto`, handed back by `recvfrom`
    /// since `+QIRD` never reports a UDP datagram's source address itself.
    remote: Option<SocketAddrV4>,
}

impl SocketRecord {
    const fn new() -> Self {
        Self {
            acquired: false,
            protocol: Protocol::Tcp,
            secure: false,
            connect_state: ConnectState::Idle,
            bound: false,
            to_be_closed: false,
            non_blocking: false,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            ring: RingBuffer::new(),
            remote: None,
        }
    }

    fn reset(&mut self, protocol: Protocol, secure: bool) {
        self.acquired = true;
        self.protocol = protocol;
        self.secure = secure;
        self.connect_state = ConnectState::Idle;
        self.bound = false;
        self.to_be_closed = false;
        self.non_blocking = false;
        self.recv_timeout = DEFAULT_RECV_TIMEOUT;
        self.ring.clear();
        self.remote = None;
    }
}

/// Fixed-size socket array plus the per-socket async lock the spec calls
/// "the socket lock" — held by the acquiring task for the duration of one
/// RPC (send/recv/connect/...), never by the reader loop, which instead
/// writes `to_be_closed` and the ring buffer directly (§5).
pub struct SocketTable {
    records: BlockingMutex<CriticalSectionRawMutex, core::cell::RefCell<[SocketRecord; MAX_SOCKETS]>>,
    locks: [Mutex<CriticalSectionRawMutex, ()>; MAX_SOCKETS],
    rx: [Signal<CriticalSectionRawMutex, ()>; MAX_SOCKETS],
    count: usize,
}

impl SocketTable {
    pub fn new(count: u8) -> Self {
        let count = (count as usize).clamp(1, MAX_SOCKETS);
        Self {
            records: BlockingMutex::new(core::cell::RefCell::new([
                const { SocketRecord::new() },
                const { SocketRecord::new() },
                const { SocketRecord::new() },
                const { SocketRecord::new() },
                const { SocketRecord::new() },
                const { SocketRecord::new() },
            ])),
            locks: [
                Mutex::new(()),
                Mutex::new(()),
                Mutex::new(()),
                Mutex::new(()),
                Mutex::new(()),
                Mutex::new(()),
            ],
            rx: [
                Signal::new(),
                Signal::new(),
                Signal::new(),
                Signal::new(),
                Signal::new(),
                Signal::new(),
            ],
            count,
        }
    }

    /// Finds an unacquired slot and marks it acquired. The caller (§4.4
    /// `socket_new`) is responsible for issuing a modem-side close first if
    /// the slot was left `to_be_closed` from a previous socket.
    pub(crate) fn allocate(&self, protocol: Protocol, secure: bool) -> Option<SocketHandle> {
        self.allocate_for_reconnect(protocol, secure).map(|(handle, _)| handle)
    }

    /// Like [`Self::allocate`], but also reports whether the slot it
    /// reused was left `to_be_closed` by its previous occupant, so the
    /// caller knows to re-synchronise with the modem before reuse.
    pub(crate) fn allocate_for_reconnect(&self, protocol: Protocol, secure: bool) -> Option<(SocketHandle, bool)> {
        self.records.lock(|c| {
            let mut recs = c.borrow_mut();
            for (idx, rec) in recs.iter_mut().enumerate().take(self.count) {
                if !rec.acquired {
                    let was_to_be_closed = rec.to_be_closed;
                    rec.reset(protocol, secure);
                    return Some((idx, was_to_be_closed));
                }
            }
            None
        })
    }

    pub(crate) fn was_to_be_closed(&self, handle: SocketHandle) -> bool {
        self.records.lock(|c| c.borrow()[handle].to_be_closed)
    }

    pub fn is_acquired(&self, handle: SocketHandle) -> bool {
        self.records.lock(|c| c.borrow()[handle].acquired)
    }

    pub fn is_secure(&self, handle: SocketHandle) -> bool {
        self.records.lock(|c| c.borrow()[handle].secure)
    }

    pub fn protocol(&self, handle: SocketHandle) -> Protocol {
        self.records.lock(|c| c.borrow()[handle].protocol)
    }

    pub(crate) fn set_connect_state(&self, handle: SocketHandle, status: i64) {
        self.records.lock(|c| {
            c.borrow_mut()[handle].connect_state =
                if status == 0 { ConnectState::Connected } else { ConnectState::Failed };
        });
    }

    pub(crate) fn connect_state(&self, handle: SocketHandle) -> Option<ConnectState> {
        self.records.lock(|c| {
            let rec = &c.borrow()[handle];
            rec.acquired.then_some(rec.connect_state)
        })
    }

    pub(crate) fn set_bound(&self, handle: SocketHandle) {
        self.records.lock(|c| c.borrow_mut()[handle].bound = true);
    }

    pub(crate) fn set_remote(&self, handle: SocketHandle, addr: SocketAddrV4) {
        self.records.lock(|c| c.borrow_mut()[handle].remote = Some(addr));
    }

    pub(crate) fn remote(&self, handle: SocketHandle) -> Option<SocketAddrV4> {
        self.records.lock(|c| c.borrow()[handle].remote)
    }

    /// Marks a socket to-be-closed (URC-driven: closed/pdpdeact) and wakes
    /// its receiver.
    pub(crate) fn mark_to_be_closed(&self, handle: SocketHandle) {
        self.records.lock(|c| c.borrow_mut()[handle].to_be_closed = true);
        self.rx[handle].signal(());
    }

    pub(crate) fn mark_all_to_be_closed(&self) {
        self.records.lock(|c| {
            let mut recs = c.borrow_mut();
            for rec in recs.iter_mut().take(self.count) {
                if rec.acquired {
                    rec.to_be_closed = true;
                }
            }
        });
        for sig in &self.rx[..self.count] {
            sig.signal(());
        }
    }

    pub fn is_to_be_closed(&self, handle: SocketHandle) -> bool {
        self.records.lock(|c| c.borrow()[handle].to_be_closed)
    }

    /// Releases the slot. Idempotent: closing an already-released socket
    /// is a no-op (§8 round-trip law "close is idempotent").
    pub(crate) fn release(&self, handle: SocketHandle) {
        self.records.lock(|c| c.borrow_mut()[handle].acquired = false);
        self.rx[handle].signal(());
    }

    pub fn set_non_blocking(&self, handle: SocketHandle, on: bool) {
        self.records.lock(|c| c.borrow_mut()[handle].non_blocking = on);
    }

    pub fn is_non_blocking(&self, handle: SocketHandle) -> bool {
        self.records.lock(|c| c.borrow()[handle].non_blocking)
    }

    pub fn set_recv_timeout(&self, handle: SocketHandle, timeout: Duration) {
        let clamped = if timeout > DEFAULT_RECV_TIMEOUT { DEFAULT_RECV_TIMEOUT } else { timeout };
        self.records.lock(|c| c.borrow_mut()[handle].recv_timeout = clamped);
    }

    pub fn recv_timeout(&self, handle: SocketHandle) -> Duration {
        self.records.lock(|c| c.borrow()[handle].recv_timeout)
    }

    /// Drains up to `out.len()` bytes already buffered from a previous
    /// over-read (§4.4 "Receive": ring buffer is always drained first).
    pub(crate) fn drain_ring(&self, handle: SocketHandle, out: &mut [u8]) -> usize {
        self.records.lock(|c| c.borrow_mut()[handle].ring.pop_into(out))
    }

    pub(crate) fn push_ring(&self, handle: SocketHandle, bytes: &[u8]) -> usize {
        self.records.lock(|c| c.borrow_mut()[handle].ring.push_slice(bytes))
    }

    /// Discards whatever remains buffered (§4.4 "Receive": a UDP datagram
    /// is delivered atomically, so a short caller buffer loses the rest of
    /// it rather than prepending it to the next `recvfrom`).
    pub(crate) fn flush_ring(&self, handle: SocketHandle) {
        self.records.lock(|c| c.borrow_mut()[handle].ring.clear());
    }

    pub fn ring_len(&self, handle: SocketHandle) -> usize {
        self.records.lock(|c| c.borrow()[handle].ring.len())
    }

    pub(crate) fn ring_is_empty(&self, handle: SocketHandle) -> bool {
        self.records.lock(|c| c.borrow()[handle].ring.is_empty())
    }

    /// Acquires the per-socket async lock for the duration of one RPC.
    pub(crate) async fn lock(&self, handle: SocketHandle) -> embassy_sync::mutex::MutexGuard<'_, CriticalSectionRawMutex, ()> {
        self.locks[handle].lock().await
    }

    pub(crate) fn signal_rx(&self, handle: SocketHandle) {
        self.rx[handle].signal(());
    }

    pub(crate) async fn wait_rx(&self, handle: SocketHandle) {
        self.rx[handle].wait().await;
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.count
    }

    pub(crate) fn validate(&self, handle: SocketHandle) -> Result<(), Error> {
        if handle >= self.count || !self.is_acquired(handle) {
            Err(Error::TypeError)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_wraps_around() {
        let mut ring = RingBuffer::new();
        assert_eq!(ring.push_slice(b"hello"), 5);
        let mut out = [0u8; 3];
        assert_eq!(ring.pop_into(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(ring.push_slice(b"world"), 5);
        let mut rest = [0u8; 7];
        assert_eq!(ring.pop_into(&mut rest), 7);
        assert_eq!(&rest, b"loworld");
        assert!(ring.is_empty());
    }

    #[test]
    fn ring_buffer_never_exceeds_capacity() {
        let mut ring = RingBuffer::new();
        let chunk = [0xABu8; 200];
        assert_eq!(ring.push_slice(&chunk), 200);
        assert_eq!(ring.push_slice(&chunk), 56);
        assert_eq!(ring.len(), RING_CAPACITY);
    }

    #[test]
    fn allocate_and_release_returns_same_index() {
        let table = SocketTable::new(6);
        let h = table.allocate(Protocol::Tcp, false).unwrap();
        table.release(h);
        let h2 = table.allocate(Protocol::Tcp, false).unwrap();
        assert_eq!(h, h2);
    }

    #[test]
    fn double_close_is_idempotent() {
        let table = SocketTable::new(6);
        let h = table.allocate(Protocol::Udp, false).unwrap();
        table.release(h);
        table.release(h); // must not panic
        assert!(!table.is_acquired(h));
    }

    #[test]
    fn flush_ring_discards_a_short_udp_read_remainder() {
        let table = SocketTable::new(6);
        let h = table.allocate(Protocol::Udp, false).unwrap();
        table.push_ring(h, b"one-datagram");
        let mut out = [0u8; 4];
        assert_eq!(table.drain_ring(h, &mut out), 4);
        table.flush_ring(h);
        assert_eq!(table.ring_len(h), 0);
    }

    #[test]
    fn ip_formats_dotted_decimal() {
        let addr = SocketAddrV4::new([192, 168, 1, 42], 80);
        assert_eq!(addr.ip_to_heapless().as_str(), "192.168.1.42");
    }
}
