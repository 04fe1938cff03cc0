//! The public facade (§4.4, §4.6, §6): a BSD-style sockets API plus DNS,
//! TLS, SMS, GNSS and RTC helpers, all layered on the slot arbiter.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, with_timeout};
use heapless::{String, Vec};

use crate::command::device;
use crate::command::gnss::{self, GnssFix};
use crate::command::network;
use crate::command::pdp;
use crate::command::sms::{self, SmsEntry};
use crate::command::socket as socket_cmd;
use crate::command::ssl_tls;
use crate::config::Config;
use crate::descriptor::CommandId;
use crate::error::Error;
use crate::slot::{SendResult, SlotArbiter, SlotGuard, RESPONSE_CAPACITY};
use crate::socket::{MAX_SOCKETS, Protocol, RING_CAPACITY, SocketAddrV4, SocketHandle, SocketTable};
use crate::state::{GlobalState, NetworkInfo, OperatorEntry, RegistrationDomain};
use crate::urc;

/// Threshold past which new sockets are refused and existing ones are
/// force-closed from the next keepalive (§4.4, §7).
const UNREGISTERED_CLOSE_THRESHOLD_SECS: i64 = 60;
/// `isalive`'s unacked-byte dead-connection threshold (§4.4 "Recv timeout and keepalive").
const UNACKED_DEAD_THRESHOLD: usize = 1_500;
/// Ceiling a blocked `recv` waits for new data before probing `isalive` (§5).
const RECV_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// How long `connect`/`bind` poll the connect URC (§4.4 "Asynchronous open").
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// `+QICLOSE`/`+QSSLCLOSE`'s graceful-close deadline.
const CLOSE_TIMEOUT_S: u8 = 10;

/// Cached device identity (§4.6 "mobile_info") — re-read only once per
/// driver lifetime, since it cannot change without a SIM swap.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MobileInfo {
    pub imei: String<16>,
    pub iccid: String<24>,
}

/// Host driver entry point. One instance per modem; `'a` ties it to the
/// [`SlotArbiter`]/[`GlobalState`]/[`SocketTable`] it shares with the reader
/// loop spawned separately via [`crate::mux::run`].
pub struct Modem<'a, W: embedded_io_async::Write> {
    port: Mutex<CriticalSectionRawMutex, W>,
    arbiter: &'a SlotArbiter,
    state: &'a GlobalState,
    sockets: &'a SocketTable,
    config: Config,
    /// Serialises `resolve()` calls (§9 "DNS scratch is a singleton" — only
    /// one resolution may be in flight).
    dns_lock: Mutex<CriticalSectionRawMutex, ()>,
    identity: Mutex<CriticalSectionRawMutex, Option<MobileInfo>>,
}

impl<'a, W: embedded_io_async::Write> Modem<'a, W> {
    pub fn new(port: W, arbiter: &'a SlotArbiter, state: &'a GlobalState, sockets: &'a SocketTable, config: Config) -> Self {
        Self {
            port: Mutex::new(port),
            arbiter,
            state,
            sockets,
            config,
            dns_lock: Mutex::new(()),
            identity: Mutex::new(None),
        }
    }

    fn cmd_timeout(&self) -> Duration {
        Duration::from_millis(self.config.command_timeout_ms as u64)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.connect_timeout_ms as u64)
    }

    fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.config.dns_timeout_ms as u64)
    }

    async fn write_line(&self, line: &str) -> Result<(), Error> {
        let mut port = self.port.lock().await;
        port.write_all(line.as_bytes()).await.map_err(|_| Error::IoError)?;
        port.write_all(b"\r").await.map_err(|_| Error::IoError)
    }

    async fn send_only_ok(&self, line: &str, id: CommandId, timeout: Duration) -> Result<(), Error> {
        let guard = self.arbiter.acquire(id, 0, timeout).await;
        self.write_line(line).await?;
        guard.wait_for_completion().await?;
        Ok(())
    }

    async fn send_with_response(
        &self,
        line: &str,
        id: CommandId,
        expected_lines: u8,
        timeout: Duration,
    ) -> Result<Vec<u8, RESPONSE_CAPACITY>, Error> {
        let guard = self.arbiter.acquire(id, expected_lines, timeout).await;
        self.write_line(line).await?;
        guard.wait_for_completion().await?;
        Ok(guard.response())
    }

    /// Used by `+CMGS`: awaits PROMPT mode, writes the text body plus the
    /// SMS `^Z` terminator, then the `+CMGS: <index>` acknowledgement.
    async fn send_payload_command(
        &self,
        line: &str,
        id: CommandId,
        expected_lines: u8,
        timeout: Duration,
        payload: &[u8],
        extra: &[u8],
    ) -> Result<Vec<u8, RESPONSE_CAPACITY>, Error> {
        let guard = self.arbiter.acquire(id, expected_lines, timeout).await;
        self.write_line(line).await?;
        {
            let mut port = self.port.lock().await;
            guard.wait_for_prompt_mode(payload, extra, &mut *port).await?;
        }
        guard.wait_for_completion().await?;
        Ok(guard.response())
    }

    /// Used by `+QFUPL`: awaits BUFFER mode (the `CONNECT` line), writes the
    /// credential bytes directly, then the trailing `OK`.
    async fn send_file_upload(&self, line: &str, id: CommandId, timeout: Duration, payload: &[u8]) -> Result<(), Error> {
        let guard = self.arbiter.acquire(id, 0, timeout).await;
        self.write_line(line).await?;
        guard.wait_for_buffer_mode().await?;
        {
            let mut port = self.port.lock().await;
            for chunk in payload.chunks(64) {
                port.write_all(chunk).await.map_err(|_| Error::IoError)?;
            }
        }
        self.state.set_mode(crate::state::Mode::Normal);
        guard.wait_for_completion().await?;
        Ok(())
    }

    /// Shared by TCP/UDP/secure send: awaits PROMPT, writes `data`, then
    /// distinguishes `SEND OK`/`SEND FAIL`/error (§4.4 "Send").
    async fn write_and_await_send(&self, id: CommandId, line: &str, data: &[u8]) -> Result<SendResult, Error> {
        let guard = self.arbiter.acquire(id, 0, self.cmd_timeout()).await;
        self.write_line(line).await?;
        {
            let mut port = self.port.lock().await;
            guard.wait_for_prompt_mode(data, &[], &mut *port).await?;
        }
        Ok(guard.wait_for_send_result().await)
    }

    async fn send_inner(&self, handle: SocketHandle, data: &[u8], addr: Option<SocketAddrV4>) -> Result<i32, Error> {
        self.sockets.validate(handle)?;
        let _lock = self.sockets.lock(handle).await;
        let secure = self.sockets.is_secure(handle);

        let (id, line) = if secure {
            let line = ssl_tls::format_send(handle, data.len());
            (CommandId::Qsslsend, String::<96>::try_from(line.as_str()).unwrap_or_default())
        } else if let Some(addr) = addr {
            let host = addr.ip_to_heapless();
            let line = socket_cmd::format_sendto(handle, data.len(), &host, addr.port);
            (CommandId::Qisend, String::<96>::try_from(line.as_str()).unwrap_or_default())
        } else {
            let line = socket_cmd::format_send(handle, data.len());
            (CommandId::Qisend, String::<96>::try_from(line.as_str()).unwrap_or_default())
        };

        if let Some(addr) = addr {
            self.sockets.set_remote(handle, addr);
        }

        match self.write_and_await_send(id, &line, data).await? {
            SendResult::Sent => Ok(data.len() as i32),
            SendResult::Full => Ok(0),
            SendResult::Error(e) => {
                self.sockets.mark_to_be_closed(handle);
                Err(e.into())
            }
        }
    }

    async fn issue_read(&self, handle: SocketHandle, id: CommandId, line: &str) -> Result<usize, Error> {
        let guard = self.arbiter.acquire(id, 1, self.cmd_timeout()).await;
        self.state.set_pending_read_socket(handle);
        self.write_line(line).await?;
        guard.wait_for_completion().await?;
        Ok(socket_cmd::parse_read_header(&guard.response())?)
    }

    async fn available_inner(&self, handle: SocketHandle) -> Result<usize, Error> {
        if self.sockets.is_secure(handle) {
            // No zero-length query exists for `+QSSLRECV`; peek up to what
            // the ring can actually hold and let the reader loop drain
            // whatever comes back straight into it (§4.4 "Available") —
            // requesting more than `RING_CAPACITY` would just be silently
            // dropped by `push_slice` on the way in.
            let line = ssl_tls::format_recv(handle, RING_CAPACITY);
            self.issue_read(handle, CommandId::Qsslrecv, &line).await?;
            Ok(self.sockets.ring_len(handle))
        } else {
            let guard = self.arbiter.acquire(CommandId::Qird, 1, self.cmd_timeout()).await;
            guard.set_expects_payload(false);
            let line = socket_cmd::format_available(handle);
            self.write_line(&line).await?;
            guard.wait_for_completion().await?;
            Ok(socket_cmd::parse_available(&guard.response())?)
        }
    }

    /// Pulls `available` (already known to be > 0) bytes into the ring
    /// buffer (for non-secure sockets) or drains what `available_inner`'s
    /// peek already placed there (secure), then hands the caller its slice.
    /// UDP datagrams are delivered atomically: any bytes this `out` buffer
    /// was too short to hold are discarded rather than left for the next
    /// `recv`/`recvfrom` to (wrongly) stitch onto a different datagram.
    async fn read_into(&self, handle: SocketHandle, out: &mut [u8], available: usize) -> Result<usize, Error> {
        if !self.sockets.is_secure(handle) {
            // Capped to what the ring can hold: the reader loop pushes the
            // whole advertised length into the ring before `out` is
            // consulted, and anything past `RING_CAPACITY` would be
            // silently dropped.
            let request = available.min(RING_CAPACITY);
            let line = socket_cmd::format_read(handle, request);
            self.issue_read(handle, CommandId::Qird, &line).await?;
        }
        let n = self.sockets.drain_ring(handle, out);
        if self.sockets.protocol(handle) == Protocol::Udp {
            self.sockets.flush_ring(handle);
        } else if !self.sockets.ring_is_empty(handle) {
            // More than fit in `out`: another waiting receiver should see it.
            self.sockets.signal_rx(handle);
        }
        Ok(n)
    }

    async fn recv_inner(&self, handle: SocketHandle, out: &mut [u8]) -> Result<usize, Error> {
        self.sockets.validate(handle)?;
        let _lock = self.sockets.lock(handle).await;

        loop {
            let drained = self.sockets.drain_ring(handle, out);
            if drained > 0 {
                return Ok(drained);
            }

            if self.sockets.is_to_be_closed(handle) {
                return Err(Error::Closed);
            }

            let available = self.available_inner(handle).await?;
            if available > 0 {
                return self.read_into(handle, out, available).await;
            }

            if self.sockets.is_to_be_closed(handle) {
                return Err(Error::Closed);
            }
            if self.sockets.is_non_blocking(handle) {
                return Err(Error::WouldBlock);
            }

            let timeout = self.sockets.recv_timeout(handle).min(RECV_KEEPALIVE_INTERVAL);
            if with_timeout(timeout, self.sockets.wait_rx(handle)).await.is_err() {
                self.check_keepalive(handle).await;
                if self.sockets.is_to_be_closed(handle) {
                    return Err(Error::Closed);
                }
                return Err(Error::Timeout);
            }
        }
    }

    async fn check_keepalive(&self, handle: SocketHandle) {
        if self.state.unregistered_too_long(UNREGISTERED_CLOSE_THRESHOLD_SECS) {
            self.sockets.mark_to_be_closed(handle);
            return;
        }
        if self.sockets.is_secure(handle) {
            // §9: secure sockets have no equivalent probe, always alive.
            return;
        }
        if let Ok(unacked) = self.send_status(handle).await {
            if unacked > UNACKED_DEAD_THRESHOLD {
                self.sockets.mark_to_be_closed(handle);
            }
        }
    }

    async fn send_status(&self, handle: SocketHandle) -> Result<usize, Error> {
        let guard = self.arbiter.acquire(CommandId::Qisend, 1, self.cmd_timeout()).await;
        let line = socket_cmd::format_send_status(handle);
        self.write_line(&line).await?;
        guard.wait_for_completion().await?;
        Ok(socket_cmd::parse_send_status(&guard.response())?)
    }

    async fn close_on_modem(&self, handle: SocketHandle) {
        let result = if self.sockets.is_secure(handle) {
            let line = ssl_tls::format_close(handle, CLOSE_TIMEOUT_S);
            self.send_only_ok(&line, CommandId::Qsslclose, self.cmd_timeout()).await
        } else {
            let line = socket_cmd::format_close(handle, CLOSE_TIMEOUT_S);
            self.send_only_ok(&line, CommandId::Qiclose, self.cmd_timeout()).await
        };
        if let Err(e) = result {
            warn!("socket close command failed: {}", e);
        }
    }

    async fn await_connect(&self, handle: SocketHandle) -> Result<(), Error> {
        let deadline = self.connect_timeout();
        let poll = async {
            loop {
                match self.sockets.connect_state(handle) {
                    Some(crate::socket::ConnectState::Connected) => return Ok(()),
                    Some(crate::socket::ConnectState::Failed) => return Err(Error::ConnectionRefused),
                    _ => embassy_time::Timer::after(CONNECT_POLL_INTERVAL).await,
                }
            }
        };
        match with_timeout(deadline, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    // ---- socket lifecycle (§4.4) ----------------------------------------

    pub async fn socket_new(&self, protocol: Protocol, secure: bool) -> Result<SocketHandle, Error> {
        if self.state.unregistered_too_long(UNREGISTERED_CLOSE_THRESHOLD_SECS) {
            return Err(Error::ConnectionRefused);
        }
        let (handle, was_to_be_closed) =
            self.sockets.allocate_for_reconnect(protocol, secure).ok_or(Error::Unsupported)?;
        if was_to_be_closed {
            self.close_on_modem(handle).await;
        }
        Ok(handle)
    }

    pub async fn connect(&self, handle: SocketHandle, host: &str, port: u16) -> Result<(), Error> {
        self.sockets.validate(handle)?;
        let profile = self.config.profile;
        let secure = self.sockets.is_secure(handle);
        let line = if secure {
            let context_id = handle as u8 + 1;
            ssl_tls::format_open(profile, handle, context_id, host, port)
        } else {
            let protocol = self.sockets.protocol(handle);
            socket_cmd::format_open(profile, handle, protocol, host, port, 0)
        };
        let id = if secure { CommandId::Qsslopen } else { CommandId::Qiopen };
        self.send_only_ok(&line, id, self.cmd_timeout()).await?;

        match self.await_connect(handle).await {
            Ok(()) => {
                if let Ok(octets) = parse_ipv4(host) {
                    self.sockets.set_remote(handle, SocketAddrV4::new(octets, port));
                }
                Ok(())
            }
            Err(e) => {
                self.sockets.mark_to_be_closed(handle);
                Err(e)
            }
        }
    }

    /// UDP only: binds a local port without a fixed remote peer (§4.4 "Bind").
    pub async fn bind(&self, handle: SocketHandle, local_port: u16) -> Result<(), Error> {
        self.sockets.validate(handle)?;
        if self.sockets.protocol(handle) != Protocol::Udp {
            return Err(Error::Unsupported);
        }
        let line = socket_cmd::format_bind(self.config.profile, handle, local_port);
        self.send_only_ok(&line, CommandId::Qiopen, self.cmd_timeout()).await?;
        self.await_connect(handle).await?;
        self.sockets.set_bound(handle);
        Ok(())
    }

    pub async fn send(&self, handle: SocketHandle, data: &[u8]) -> Result<i32, Error> {
        self.send_inner(handle, data, None).await
    }

    pub async fn sendto(&self, handle: SocketHandle, data: &[u8], addr: SocketAddrV4) -> Result<i32, Error> {
        self.send_inner(handle, data, Some(addr)).await
    }

    pub async fn recv(&self, handle: SocketHandle, out: &mut [u8]) -> Result<usize, Error> {
        self.recv_inner(handle, out).await
    }

    /// `+QIRD` never reports a UDP datagram's source address; this hands
    /// back the last peer seen via `connect`/`sendto` (§8 scenario 2).
    pub async fn recvfrom(&self, handle: SocketHandle, out: &mut [u8]) -> Result<(usize, SocketAddrV4), Error> {
        let n = self.recv_inner(handle, out).await?;
        let addr = self.sockets.remote(handle).unwrap_or(SocketAddrV4::new([0, 0, 0, 0], 0));
        Ok((n, addr))
    }

    pub async fn available(&self, handle: SocketHandle) -> Result<usize, Error> {
        self.sockets.validate(handle)?;
        let ring = self.sockets.ring_len(handle);
        if ring > 0 {
            return Ok(ring);
        }
        self.available_inner(handle).await
    }

    /// Unacked-byte count from the modem's own send queue (§4.4 "Recv
    /// timeout and keepalive"); `0` for secure sockets, which have no probe.
    pub async fn isalive(&self, handle: SocketHandle) -> Result<usize, Error> {
        self.sockets.validate(handle)?;
        if self.sockets.is_secure(handle) {
            return Ok(0);
        }
        self.send_status(handle).await
    }

    pub async fn close(&self, handle: SocketHandle) -> Result<(), Error> {
        if !self.sockets.is_acquired(handle) {
            return Ok(());
        }
        self.close_on_modem(handle).await;
        self.sockets.release(handle);
        Ok(())
    }

    pub async fn shutdown(&self, handle: SocketHandle) -> Result<(), Error> {
        self.close(handle).await
    }

    pub fn fcntl_nonblocking(&self, handle: SocketHandle, on: bool) -> Result<(), Error> {
        self.sockets.validate(handle)?;
        self.sockets.set_non_blocking(handle, on);
        Ok(())
    }

    pub fn setsockopt_recv_timeout(&self, handle: SocketHandle, timeout: Duration) -> Result<(), Error> {
        self.sockets.validate(handle)?;
        self.sockets.set_recv_timeout(handle, timeout);
        Ok(())
    }

    pub fn getsockopt_recv_timeout(&self, handle: SocketHandle) -> Result<Duration, Error> {
        self.sockets.validate(handle)?;
        Ok(self.sockets.recv_timeout(handle))
    }

    /// Checks the given sockets' ring/to-be-closed state; if none are ready,
    /// suspends on the select-wake signal (bounded by `timeout`), then
    /// re-checks once more (§4.4 ambient BSD surface).
    pub async fn select(&self, handles: &[SocketHandle], timeout: Duration) -> Result<Vec<SocketHandle, MAX_SOCKETS>, Error> {
        let ready = self.ready_handles(handles);
        if !ready.is_empty() {
            return Ok(ready);
        }
        let _ = with_timeout(timeout, self.state.wait_select_wake()).await;
        Ok(self.ready_handles(handles))
    }

    fn ready_handles(&self, handles: &[SocketHandle]) -> Vec<SocketHandle, MAX_SOCKETS> {
        let mut out = Vec::new();
        for &h in handles {
            if self.sockets.is_acquired(h) && (self.sockets.is_to_be_closed(h) || !self.sockets.ring_is_empty(h)) {
                let _ = out.push(h);
            }
        }
        out
    }

    // ---- TLS provisioning (§4.4 "socket_tls") ---------------------------

    async fn upload_credential(&self, filename: &str, pem: &[u8]) -> Result<(), Error> {
        let delete = ssl_tls::format_delete_file(filename);
        // The file may not exist yet on a fresh module; a failed delete is
        // not fatal to provisioning.
        let _ = self.send_only_ok(&delete, CommandId::Qfdel, self.cmd_timeout()).await;
        let upload = ssl_tls::format_upload_file(filename, pem.len());
        self.send_file_upload(&upload, CommandId::Qfupl, self.cmd_timeout(), pem).await
    }

    pub async fn socket_tls(
        &self,
        handle: SocketHandle,
        ca_cert: Option<&[u8]>,
        client_cert: Option<&[u8]>,
        client_key: Option<&[u8]>,
    ) -> Result<(), Error> {
        self.sockets.validate(handle)?;
        let context_id = handle as u8 + 1;

        if let Some(pem) = ca_cert {
            self.upload_credential(&ssl_tls::ca_cert_filename(handle), pem).await?;
        }
        if let Some(pem) = client_cert {
            self.upload_credential(&ssl_tls::client_cert_filename(handle), pem).await?;
        }
        if let Some(pem) = client_key {
            self.upload_credential(&ssl_tls::private_key_filename(handle), pem).await?;
        }

        self.send_only_ok(&ssl_tls::format_set_ssl_version(context_id), CommandId::Qsslcfg, self.cmd_timeout())
            .await?;
        self.send_only_ok(&ssl_tls::format_set_cipher_suite(context_id), CommandId::Qsslcfg, self.cmd_timeout())
            .await?;
        if ca_cert.is_some() {
            self.send_only_ok(&ssl_tls::format_configure_context(context_id, handle), CommandId::Qsslcfg, self.cmd_timeout())
                .await?;
        }
        if client_cert.is_some() {
            self.send_only_ok(
                &ssl_tls::format_configure_client_cert(context_id, handle),
                CommandId::Qsslcfg,
                self.cmd_timeout(),
            )
            .await?;
        }
        if client_key.is_some() {
            self.send_only_ok(
                &ssl_tls::format_configure_client_key(context_id, handle),
                CommandId::Qsslcfg,
                self.cmd_timeout(),
            )
            .await?;
        }
        let seclevel = if client_cert.is_some() && client_key.is_some() {
            2
        } else if ca_cert.is_some() {
            1
        } else {
            0
        };
        self.send_only_ok(&ssl_tls::format_set_security_level(context_id, seclevel), CommandId::Qsslcfg, self.cmd_timeout())
            .await?;
        self.send_only_ok(&ssl_tls::format_set_ignore_local_time(context_id), CommandId::Qsslcfg, self.cmd_timeout())
            .await?;
        Ok(())
    }

    // ---- PDP / registration bring-up (§4.6) -----------------------------

    /// Device/PDP/registration bring-up sequence run once at startup.
    pub async fn begin(&self) -> Result<(), Error> {
        self.send_only_ok(&device::format_set_cme_error_reports(true), CommandId::Cmee, self.cmd_timeout())
            .await?;
        self.send_only_ok(&device::format_set_functionality(1), CommandId::Cfun, self.cmd_timeout()).await?;

        for domain in [RegistrationDomain::Gsm, RegistrationDomain::Gprs, RegistrationDomain::Eps] {
            let line = network::format_enable_registration_urc(domain);
            self.send_only_ok(&line, registration_command_id(domain), self.cmd_timeout()).await?;
        }
        self.send_only_ok(pdp::format_enable_packet_domain_event_reporting(), CommandId::Cgerep, self.cmd_timeout())
            .await?;

        let cid = self.config.profile;
        self.send_only_ok(&pdp::format_define_context(cid, &self.config.apn), CommandId::Cgdcont, self.cmd_timeout())
            .await?;
        let psd = pdp::format_set_tcpip_context(cid, &self.config.apn, &self.config.user, &self.config.password, self.config.auth);
        self.send_only_ok(&psd, CommandId::Qicsgp, self.cmd_timeout()).await?;

        let activate_timeout = Duration::from_secs(180);
        self.send_only_ok(&pdp::format_activate_context(cid), CommandId::Qiact, activate_timeout).await?;

        self.check_network().await
    }

    pub async fn check_network(&self) -> Result<(), Error> {
        for domain in [RegistrationDomain::Gsm, RegistrationDomain::Gprs, RegistrationDomain::Eps] {
            let line = network::format_query_registration(domain);
            let response = self
                .send_with_response(&line, registration_command_id(domain), 1, self.cmd_timeout())
                .await?;
            urc::dispatch_registration(domain, &response, self.state);
        }
        Ok(())
    }

    pub async fn configure_psd(&self) -> Result<(), Error> {
        let cid = self.config.profile;
        let line = pdp::format_set_tcpip_context(cid, &self.config.apn, &self.config.user, &self.config.password, self.config.auth);
        self.send_only_ok(&line, CommandId::Qicsgp, self.cmd_timeout()).await
    }

    pub async fn control_psd(&self, activate: bool) -> Result<(), Error> {
        let cid = self.config.profile;
        let timeout = Duration::from_secs(180);
        if activate {
            self.send_only_ok(&pdp::format_activate_context(cid), CommandId::Qiact, timeout).await
        } else {
            self.send_only_ok(&pdp::format_deactivate_context(cid), CommandId::Qideact, timeout).await
        }
    }

    pub async fn attach(&self) -> Result<(), Error> {
        self.send_only_ok(&pdp::format_set_attach(true), CommandId::Cgatt, self.cmd_timeout()).await
    }

    pub async fn detach(&self) -> Result<(), Error> {
        self.send_only_ok(&pdp::format_set_attach(false), CommandId::Cgatt, self.cmd_timeout()).await
    }

    /// Resolves `hostname` via `+QIDNSGIP`; the first address to arrive via
    /// the `"dnsgip"` URC sequence is the resolution (§4.6, §9 singleton).
    pub async fn resolve(&self, hostname: &str) -> Result<String<46>, Error> {
        let _dns = self.dns_lock.lock().await;
        self.state.dns_begin();
        let line = socket_cmd::format_resolve(self.config.profile, hostname);
        self.send_only_ok(&line, CommandId::Qidnsgip, self.cmd_timeout()).await?;

        match with_timeout(self.dns_timeout(), self.state.dns_wait_ready()).await {
            Ok(()) => self.state.dns_address().ok_or(Error::Runtime),
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn operators(&self) -> Result<Vec<OperatorEntry, 6>, Error> {
        let timeout = Duration::from_secs(180);
        let response = self
            .send_with_response(network::format_list_operators(), CommandId::Cops, 1, timeout)
            .await?;
        let table = network::parse_operator_list(&response)?;
        self.state.replace_operators(table.clone());
        Ok(table)
    }

    pub async fn set_operator(&self, numeric: &str) -> Result<(), Error> {
        let line = network::format_set_operator_manual(2, numeric);
        self.send_only_ok(&line, CommandId::Cops, self.cmd_timeout()).await
    }

    pub async fn set_operator_auto(&self) -> Result<(), Error> {
        self.send_only_ok(network::format_set_operator_auto(), CommandId::Cops, self.cmd_timeout()).await
    }

    pub async fn rssi(&self) -> Result<i16, Error> {
        let response = self
            .send_with_response(device::format_get_signal_quality(), CommandId::Csq, 1, self.cmd_timeout())
            .await?;
        Ok(device::parse_signal_quality(&response)?)
    }

    pub fn network_info(&self) -> NetworkInfo {
        self.state.network_info()
    }

    /// IMEI/ICCID, read via `+GSN`/`+QCCID` once and cached thereafter.
    pub async fn mobile_info(&self) -> Result<MobileInfo, Error> {
        {
            let cached = self.identity.lock().await;
            if let Some(info) = cached.as_ref() {
                return Ok(info.clone());
            }
        }

        let imei_resp = self
            .send_with_response(device::format_get_imei(), CommandId::Gsn, 1, self.cmd_timeout())
            .await?;
        let imei = device::parse_bare_string::<16>(&imei_resp)?;

        let iccid_resp = self
            .send_with_response(device::format_get_iccid(), CommandId::Qccid, 1, self.cmd_timeout())
            .await?;
        let iccid = device::parse_bare_string::<24>(&iccid_resp)?;

        let info = MobileInfo { imei, iccid };
        *self.identity.lock().await = Some(info.clone());
        Ok(info)
    }

    /// Raw `+QENG="servingcell"` response line, for callers that need the
    /// serving-cell detail beyond what [`NetworkInfo`] summarises.
    pub async fn link_info(&self) -> Result<String<128>, Error> {
        let response = self
            .send_with_response(device::format_get_cell_info(), CommandId::Qeng, 1, self.cmd_timeout())
            .await?;
        let text = core::str::from_utf8(&response).map_err(|_| Error::TypeError)?;
        String::try_from(text).map_err(|_| Error::TypeError)
    }

    pub async fn get_rtc(&self) -> Result<device::RtcTime, Error> {
        let response = self
            .send_with_response(device::format_get_clock(), CommandId::Cclk, 1, self.cmd_timeout())
            .await?;
        let text = core::str::from_utf8(&response).map_err(|_| Error::TypeError)?;
        device::parse_clock(text)
    }

    // ---- SMS (§4.6) ------------------------------------------------------

    pub async fn sms_send(&self, number: &str, text: &str) -> Result<u16, Error> {
        self.send_only_ok(sms::format_set_text_mode(), CommandId::Cmgf, self.cmd_timeout()).await?;
        let line = sms::format_send(number);
        let response = self
            .send_payload_command(&line, CommandId::Cmgs, 1, self.cmd_timeout(), text.as_bytes(), &[0x1A])
            .await?;
        Ok(sms::parse_send_ack(&response)?)
    }

    pub async fn sms_list(&self, unread_only: bool, max: usize, offset: usize) -> Result<Vec<SmsEntry, 8>, Error> {
        self.send_only_ok(sms::format_set_text_mode(), CommandId::Cmgf, self.cmd_timeout()).await?;
        let filter = if unread_only { "REC UNREAD" } else { "ALL" };
        let line = sms::format_list(filter);
        let guard = self.arbiter.acquire(CommandId::Cmgl, 0, self.cmd_timeout()).await;
        self.write_line(&line).await?;
        guard.wait_for_completion().await?;

        // The iterator response ships header and body on alternating lines
        // within the slot's accumulated, `\n`-joined response buffer.
        let response = guard.response();
        let text = core::str::from_utf8(&response).map_err(|_| Error::TypeError)?;
        Ok(sms::accumulate_list(text, max, offset))
    }

    pub async fn sms_delete(&self, index: u16) -> Result<(), Error> {
        let line = sms::format_delete(index);
        self.send_only_ok(&line, CommandId::Cmgd, self.cmd_timeout()).await
    }

    pub async fn sms_pending(&self) -> u16 {
        self.state.take_pending_sms()
    }

    pub async fn sms_get_scsa(&self) -> Result<String<24>, Error> {
        let response = self
            .send_with_response("+CSCA?", CommandId::Csca, 1, self.cmd_timeout())
            .await?;
        let text = core::str::from_utf8(&response).map_err(|_| Error::TypeError)?;
        String::try_from(text.trim_matches('"')).map_err(|_| Error::TypeError)
    }

    pub async fn sms_set_scsa(&self, number: &str) -> Result<(), Error> {
        let line = sms::format_set_sms_service_center(number);
        self.send_only_ok(&line, CommandId::Csca, self.cmd_timeout()).await
    }

    // ---- GNSS (§4.6) ------------------------------------------------------

    pub async fn gnss_init(&self, rate_s: u16, use_uart3: bool) -> Result<(), Error> {
        self.send_only_ok(gnss::format_set_nmea_source(use_uart3), CommandId::Qgpscfg, self.cmd_timeout()).await?;
        self.send_only_ok(gnss::format_set_gnss_config(), CommandId::Qgpscfg, self.cmd_timeout()).await?;
        let line = gnss::format_start(50, 30, rate_s);
        self.send_only_ok(&line, CommandId::Qgps, self.cmd_timeout()).await?;
        if use_uart3 {
            self.send_only_ok(gnss::format_set_output_port_uart_nmea(), CommandId::Qgpscfg, self.cmd_timeout())
                .await?;
        }
        Ok(())
    }

    pub async fn gnss_done(&self) -> Result<(), Error> {
        self.send_only_ok(gnss::format_stop(), CommandId::Qgpsend, self.cmd_timeout()).await
    }

    pub async fn gnss_loc(&self) -> Result<GnssFix, Error> {
        let response = self
            .send_with_response(gnss::format_get_fix(), CommandId::Qgpsloc, 1, self.cmd_timeout())
            .await?;
        Ok(gnss::parse_fix(&response)?)
    }
}

fn registration_command_id(domain: RegistrationDomain) -> CommandId {
    match domain {
        RegistrationDomain::Gsm => CommandId::Creg,
        RegistrationDomain::Gprs => CommandId::Cgreg,
        RegistrationDomain::Eps => CommandId::Cereg,
    }
}

/// Parses a dotted-decimal IPv4 literal, used to remember the peer address
/// a TCP `connect` targeted (the modem itself never reports it back).
fn parse_ipv4(host: &str) -> Result<[u8; 4], Error> {
    let mut octets = [0u8; 4];
    let mut parts = host.split('.');
    for slot in &mut octets {
        let part = parts.next().ok_or(Error::TypeError)?;
        *slot = part.parse().map_err(|_| Error::TypeError)?;
    }
    if parts.next().is_some() {
        return Err(Error::TypeError);
    }
    Ok(octets)
}

#[cfg(test)]
mod tests {
    use heapless::Vec as HVec;

    use super::*;
    use crate::socket::Protocol;

    struct Duplex {
        inbound: HVec<u8, 4096>,
        pos: usize,
        outbound: HVec<u8, 4096>,
    }

    #[derive(Debug)]
    struct FakeError;
    impl embedded_io_async::Error for FakeError {
        fn kind(&self) -> embedded_io_async::ErrorKind {
            embedded_io_async::ErrorKind::Other
        }
    }
    impl embedded_io_async::ErrorType for Duplex {
        type Error = FakeError;
    }
    impl embedded_io_async::Read for Duplex {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            if self.pos >= self.inbound.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.inbound.len() - self.pos);
            buf[..n].copy_from_slice(&self.inbound.as_slice()[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
    impl embedded_io_async::Write for Duplex {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.outbound.extend_from_slice(buf).map_err(|_| FakeError)?;
            Ok(buf.len())
        }
    }

    fn block_on<F: core::future::Future>(f: F) -> F::Output {
        embassy_futures::block_on(f)
    }

    fn duplex_from(bytes: &[u8]) -> Duplex {
        let mut data = HVec::new();
        data.extend_from_slice(bytes).unwrap();
        Duplex { inbound: data, pos: 0, outbound: HVec::new() }
    }

    fn clock() -> i64 {
        1_700_000_000
    }

    #[test]
    fn rssi_round_trips_through_the_slot() {
        let arbiter = SlotArbiter::new();
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        let port = duplex_from(b"");
        let modem = Modem::new(port, &arbiter, &state, &sockets, Config::default());

        block_on(async {
            let (rssi, ()) = embassy_futures::join::join(modem.rssi(), drive_one_response(&arbiter, b"+CSQ: 18,99\r\nOK\r\n")).await;
            assert_eq!(rssi.unwrap(), -77);
        });
    }

    /// Stands in for the real reader loop (`crate::mux::run`), which owns a
    /// serial read-half entirely separate from the [`Modem`]'s write-only
    /// `port`: classifies `transcript`'s lines against the already-acquired
    /// slot and completes it, just as `mux::run` would off a real UART.
    async fn drive_one_response(arbiter: &SlotArbiter, transcript: &'static [u8]) {
        let mut reader = crate::reader::SerialReader::new(duplex_from(transcript));
        loop {
            match reader.next_event().await.unwrap() {
                crate::reader::ReadEvent::Line => match crate::parser::classify(reader.line()) {
                    crate::parser::LineClass::Command { args, .. } => {
                        arbiter.push_response_line(args);
                    }
                    crate::parser::LineClass::Ok => {
                        arbiter.complete(crate::slot::SlotOutcome::Ok);
                        return;
                    }
                    crate::parser::LineClass::Error => {
                        arbiter.complete(crate::slot::SlotOutcome::Error(crate::slot::SlotError::Invalid));
                        return;
                    }
                    crate::parser::LineClass::Unknown(raw) => {
                        // `+CMGL`'s message-body lines arrive unlabelled.
                        if arbiter
                            .active_command()
                            .is_some_and(|id| crate::descriptor::spec(id).style == crate::descriptor::ResponseStyle::Iterator)
                        {
                            arbiter.push_response_line(raw);
                        }
                    }
                    _ => {}
                },
                crate::reader::ReadEvent::Prompt => arbiter.enter_prompt(),
            }
        }
    }

    #[test]
    fn recv_request_is_capped_to_ring_capacity_not_the_full_advertised_length() {
        let arbiter = SlotArbiter::new();
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        let h = sockets.allocate(Protocol::Tcp, false).unwrap();
        let port = duplex_from(b"");
        let modem = Modem::new(port, &arbiter, &state, &sockets, Config::default());

        let mut out = [0u8; 8];
        block_on(async {
            let (result, ()) = embassy_futures::join::join(
                modem.read_into(h, &mut out, 2_000),
                drive_one_response(&arbiter, b"+QIRD: 0\r\nOK\r\n"),
            )
            .await;
            assert_eq!(result.unwrap(), 0);
        });

        block_on(async {
            let port = modem.port.lock().await;
            let sent = core::str::from_utf8(&port.outbound).unwrap();
            assert!(sent.contains("+QIRD=0,256"), "expected a request capped to RING_CAPACITY, got: {sent}");
        });
    }

    /// A movable wall clock for the one test that needs elapsed time to
    /// actually pass, since [`crate::state::WallClockFn`] is a bare `fn`
    /// pointer rather than a capturing closure.
    static UNREGISTERED_TEST_CLOCK: core::sync::atomic::AtomicI64 = core::sync::atomic::AtomicI64::new(1_700_000_000);

    fn moving_clock() -> i64 {
        UNREGISTERED_TEST_CLOCK.load(core::sync::atomic::Ordering::Relaxed)
    }

    #[test]
    fn socket_new_refuses_once_unregistered_past_the_threshold() {
        use core::sync::atomic::Ordering;
        UNREGISTERED_TEST_CLOCK.store(1_700_000_000, Ordering::Relaxed);

        let arbiter = SlotArbiter::new();
        let state = GlobalState::new(moving_clock);
        let sockets = SocketTable::new(6);
        state.update_registration(RegistrationDomain::Gprs, crate::state::RegistrationState::RegisteredHome, None, None, None);
        state.update_registration(RegistrationDomain::Gprs, crate::state::RegistrationState::Searching, None, None, None);

        let port = duplex_from(b"");
        let modem = Modem::new(port, &arbiter, &state, &sockets, Config::default());

        assert!(!state.unregistered_too_long(UNREGISTERED_CLOSE_THRESHOLD_SECS));
        block_on(async {
            assert!(modem.socket_new(Protocol::Tcp, false).await.is_ok());
        });

        UNREGISTERED_TEST_CLOCK.fetch_add(UNREGISTERED_CLOSE_THRESHOLD_SECS + 1, Ordering::Relaxed);
        assert!(state.unregistered_too_long(UNREGISTERED_CLOSE_THRESHOLD_SECS));
        block_on(async {
            let result = modem.socket_new(Protocol::Tcp, false).await;
            assert!(matches!(result, Err(Error::ConnectionRefused)));
        });
    }

    #[test]
    fn parse_ipv4_accepts_dotted_decimal_and_rejects_garbage() {
        assert_eq!(parse_ipv4("8.8.8.8").unwrap(), [8, 8, 8, 8]);
        assert!(parse_ipv4("not.an.ip").is_err());
        assert!(parse_ipv4("1.2.3").is_err());
    }

    #[test]
    fn recvfrom_defaults_to_zero_address_before_any_peer_is_known() {
        let sockets = SocketTable::new(6);
        let h = sockets.allocate(Protocol::Udp, false).unwrap();
        assert!(sockets.remote(h).is_none());
    }
}
