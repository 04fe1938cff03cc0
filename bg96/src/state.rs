//! Process-wide modem state (§3 "GlobalState") shared between the reader
//! loop, the URC dispatcher and client tasks.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use bitflags::bitflags;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use heapless::{String, Vec};

/// Unix-seconds wall clock, supplied by the host-language binding layer so
/// "registered-since" timestamps are testable without a real RTC. This is
/// unrelated to the modem's own `+CCLK` clock (see `command::device`).
pub type WallClockFn = fn() -> i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Normal,
    Prompt,
    Buffer,
}

/// Network registration state, shared by `+CREG`/`+CGREG`/`+CEREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationState {
    NotSearching = 0,
    RegisteredHome = 1,
    Searching = 2,
    Denied = 3,
    Unknown = 4,
    RegisteredRoaming = 5,
    RegisteredSmsOnlyHome = 6,
    RegisteredSmsOnlyRoaming = 7,
    AttachedEmergencyOnly = 8,
    RegisteredCsfbNotPreferredHome = 9,
    RegisteredCsfbNotPreferredRoaming = 10,
    RegisteredTempConnLoss = 80,
}

impl RegistrationState {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::NotSearching,
            1 => Self::RegisteredHome,
            2 => Self::Searching,
            3 => Self::Denied,
            4 => Self::Unknown,
            5 => Self::RegisteredRoaming,
            6 => Self::RegisteredSmsOnlyHome,
            7 => Self::RegisteredSmsOnlyRoaming,
            8 => Self::AttachedEmergencyOnly,
            9 => Self::RegisteredCsfbNotPreferredHome,
            10 => Self::RegisteredCsfbNotPreferredRoaming,
            80 => Self::RegisteredTempConnLoss,
            _ => return None,
        })
    }

    /// Anything other than not-searching/searching/denied/unknown counts as
    /// "OK" for the purposes of the aggregate precedence rule (§4.5, invariant 4).
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::NotSearching | Self::Searching | Self::Denied | Self::Unknown)
    }
}

bitflags! {
    /// Radio-access-technology bitmask. `eps_act` 8 maps to `LTE_M1`, 9 to
    /// `LTE_NB1`, any other EPS act to plain `LTE` (§4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct TechMask: u8 {
        const GSM = 0b0000_0001;
        const GPRS = 0b0000_0010;
        const LTE = 0b0000_0100;
        const LTE_M1 = 0b0000_1000;
        const LTE_NB1 = 0b0001_0000;
    }
}

/// Read-only snapshot handed out by `Modem::network_info` (ambient addition, §4.6).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetworkInfo {
    pub gsm: RegistrationState,
    pub gprs: RegistrationState,
    pub eps: RegistrationState,
    /// `EPS` if `EPS.is_ok()`, else `GPRS` if `GPRS.is_ok()`, else `NOT`
    /// (invariant 4) — re-expressed here as the winning state, or `None`.
    pub registered: Option<RegistrationState>,
    pub tech: TechMask,
    pub lac: String<8>,
    pub ci: String<8>,
    pub registered_since: Option<i64>,
    pub unregistered_since: Option<i64>,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            gsm: RegistrationState::NotSearching,
            gprs: RegistrationState::NotSearching,
            eps: RegistrationState::NotSearching,
            registered: None,
            tech: TechMask::empty(),
            lac: String::new(),
            ci: String::new(),
            registered_since: None,
            unregistered_since: None,
        }
    }
}

/// A single `+COPS=?` operator table row (§3 "OperatorEntry").
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OperatorEntry {
    pub stat: u8,
    pub long_name: String<24>,
    pub short_name: String<10>,
    pub numeric: String<8>,
}

#[derive(Default)]
struct DnsScratch {
    address: String<46>,
    expected_count: u8,
    received: u8,
    ready: bool,
}

/// Which RAT table the last `update_registration` call touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegistrationDomain {
    Gsm,
    Gprs,
    Eps,
}

pub struct GlobalState {
    wall_clock: WallClockFn,
    mode: BlockingMutex<CriticalSectionRawMutex, RefCell<Mode>>,
    net: BlockingMutex<CriticalSectionRawMutex, RefCell<NetworkInfo>>,
    dns: BlockingMutex<CriticalSectionRawMutex, RefCell<DnsScratch>>,
    dns_ready: Signal<CriticalSectionRawMutex, ()>,
    pending_sms: AtomicU16,
    operators: BlockingMutex<CriticalSectionRawMutex, RefCell<Vec<OperatorEntry, 6>>>,
    /// Signalled by the URC dispatcher on `+QIURC:"recv"`/`"closed"`; woken
    /// readers of `Modem::select` re-check their socket set (§4.4).
    select_wake: Signal<CriticalSectionRawMutex, ()>,
    /// Set by the client just before issuing `+QIRD`/`+QSSLRECV`, so the
    /// reader loop knows which socket's ring buffer the raw bytes that
    /// follow the label line belong to. `usize::MAX` means "none" — safe
    /// since `MAX_SOCKETS` is 6 (§4.2).
    pending_read_socket: AtomicUsize,
}

impl GlobalState {
    pub fn new(wall_clock: WallClockFn) -> Self {
        Self {
            wall_clock,
            mode: BlockingMutex::new(RefCell::new(Mode::Normal)),
            net: BlockingMutex::new(RefCell::new(NetworkInfo::default())),
            dns: BlockingMutex::new(RefCell::new(DnsScratch::default())),
            dns_ready: Signal::new(),
            pending_sms: AtomicU16::new(0),
            operators: BlockingMutex::new(RefCell::new(Vec::new())),
            select_wake: Signal::new(),
            pending_read_socket: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn now(&self) -> i64 {
        (self.wall_clock)()
    }

    pub fn mode(&self) -> Mode {
        self.mode.lock(|c| *c.borrow())
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        self.mode.lock(|c| *c.borrow_mut() = mode);
    }

    pub fn network_info(&self) -> NetworkInfo {
        self.net.lock(|c| c.borrow().clone())
    }

    /// Applies a `+CREG`/`+CGREG`/`+CEREG` update and recomputes the
    /// aggregate `registered` state and tech mask (§4.5).
    pub(crate) fn update_registration(
        &self,
        domain: RegistrationDomain,
        state: RegistrationState,
        lac: Option<&str>,
        ci: Option<&str>,
        eps_act: Option<i64>,
    ) {
        self.net.lock(|c| {
            let mut net = c.borrow_mut();
            match domain {
                RegistrationDomain::Gsm => net.gsm = state,
                RegistrationDomain::Gprs => net.gprs = state,
                RegistrationDomain::Eps => net.eps = state,
            }
            if let Some(lac) = lac {
                net.lac = String::try_from(lac).unwrap_or_default();
            }
            if let Some(ci) = ci {
                net.ci = String::try_from(ci).unwrap_or_default();
            }

            let was_registered = net.registered.is_some();
            net.registered = if net.eps.is_ok() {
                Some(net.eps)
            } else if net.gprs.is_ok() {
                Some(net.gprs)
            } else {
                None
            };

            net.tech = if net.registered.is_some() {
                let mut tech = TechMask::empty();
                if net.gsm.is_ok() {
                    tech |= TechMask::GSM;
                }
                if net.gprs.is_ok() {
                    tech |= TechMask::GPRS;
                }
                if net.eps.is_ok() {
                    tech |= match eps_act {
                        Some(8) => TechMask::LTE_M1,
                        Some(9) => TechMask::LTE_NB1,
                        _ => TechMask::LTE,
                    };
                }
                tech
            } else {
                net.lac.clear();
                net.ci.clear();
                TechMask::empty()
            };

            let is_registered_now = net.registered.is_some();
            if is_registered_now && !was_registered {
                net.registered_since = Some((self.wall_clock)());
                net.unregistered_since = None;
            } else if !is_registered_now && was_registered {
                net.unregistered_since = Some((self.wall_clock)());
                net.registered_since = None;
            }
        });
    }

    /// True once the modem has been continuously unregistered for at least
    /// `threshold_secs` (§4.4, §7: refuses new sockets / forces closure).
    pub fn unregistered_too_long(&self, threshold_secs: i64) -> bool {
        self.net.lock(|c| {
            c.borrow()
                .unregistered_since
                .is_some_and(|since| (self.wall_clock)() - since >= threshold_secs)
        })
    }

    pub fn increment_pending_sms(&self) {
        self.pending_sms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn take_pending_sms(&self) -> u16 {
        self.pending_sms.swap(0, Ordering::Relaxed)
    }

    pub fn pending_sms(&self) -> u16 {
        self.pending_sms.load(Ordering::Relaxed)
    }

    pub(crate) fn replace_operators(&self, table: Vec<OperatorEntry, 6>) {
        self.operators.lock(|c| *c.borrow_mut() = table);
    }

    pub fn operators(&self) -> Vec<OperatorEntry, 6> {
        self.operators.lock(|c| c.borrow().clone())
    }

    /// Begins a `+QIDNSGIP` resolution: resets the scratch and the ready flag.
    pub(crate) fn dns_begin(&self) {
        self.dns.lock(|c| *c.borrow_mut() = DnsScratch::default());
        self.dns_ready.reset();
    }

    pub(crate) fn dns_set_expected(&self, count: u8) {
        self.dns.lock(|c| c.borrow_mut().expected_count = count);
        self.dns_maybe_ready();
    }

    pub(crate) fn dns_push_address(&self, addr: &str) {
        self.dns.lock(|c| {
            let mut scratch = c.borrow_mut();
            if scratch.address.is_empty() {
                scratch.address = String::try_from(addr).unwrap_or_default();
            }
            scratch.received += 1;
        });
        self.dns_maybe_ready();
    }

    fn dns_maybe_ready(&self) {
        let ready = self.dns.lock(|c| {
            let mut scratch = c.borrow_mut();
            let done = scratch.expected_count > 0 && scratch.received >= scratch.expected_count;
            if done {
                scratch.ready = true;
            }
            done
        });
        if ready {
            self.dns_ready.signal(());
        }
    }

    pub(crate) async fn dns_wait_ready(&self) {
        self.dns_ready.wait().await;
    }

    pub fn dns_address(&self) -> Option<String<46>> {
        self.dns.lock(|c| {
            let scratch = c.borrow();
            if scratch.ready { Some(scratch.address.clone()) } else { None }
        })
    }

    pub(crate) fn wake_select(&self) {
        self.select_wake.signal(());
    }

    pub(crate) async fn wait_select_wake(&self) {
        self.select_wake.wait().await;
    }

    pub(crate) fn set_pending_read_socket(&self, handle: usize) {
        self.pending_read_socket.store(handle, Ordering::Relaxed);
    }

    pub(crate) fn take_pending_read_socket(&self) -> Option<usize> {
        match self.pending_read_socket.swap(usize::MAX, Ordering::Relaxed) {
            usize::MAX => None,
            handle => Some(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> i64 {
        1_700_000_000
    }

    #[test]
    fn aggregate_prefers_eps_over_gprs() {
        let state = GlobalState::new(clock);
        state.update_registration(
            RegistrationDomain::Gprs,
            RegistrationState::RegisteredHome,
            Some("1A2B"),
            Some("CD01"),
            None,
        );
        state.update_registration(
            RegistrationDomain::Eps,
            RegistrationState::RegisteredRoaming,
            None,
            None,
            Some(8),
        );
        let info = state.network_info();
        assert_eq!(info.registered, Some(RegistrationState::RegisteredRoaming));
        assert!(info.tech.contains(TechMask::LTE_M1));
    }

    #[test]
    fn unregistered_clears_lac_and_ci_and_starts_timer() {
        let state = GlobalState::new(clock);
        state.update_registration(
            RegistrationDomain::Gprs,
            RegistrationState::RegisteredHome,
            Some("1A2B"),
            Some("CD01"),
            None,
        );
        state.update_registration(RegistrationDomain::Gprs, RegistrationState::Searching, None, None, None);
        let info = state.network_info();
        assert_eq!(info.registered, None);
        assert!(info.lac.is_empty());
        assert!(info.ci.is_empty());
        assert_eq!(info.unregistered_since, Some(clock()));
    }

    #[test]
    fn dns_becomes_ready_once_all_addresses_arrive() {
        let state = GlobalState::new(clock);
        state.dns_begin();
        state.dns_push_address("1.2.3.4");
        assert!(state.dns_address().is_none());
        state.dns_set_expected(1);
        assert_eq!(state.dns_address().as_deref(), Some("1.2.3.4"));
    }
}
