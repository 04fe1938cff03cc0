//! The command-slot arbiter (§4.3): serialises every AT command emission
//! through a single in-flight slot with timeout and response buffer.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, with_timeout};
use heapless::Vec;

use crate::descriptor::{self, CommandId};

pub const RESPONSE_CAPACITY: usize = 512;

/// Window the client polls `wait_for_prompt_mode`/`wait_for_buffer_mode`
/// before giving up — the modem's own URC window can be much longer (the
/// connect URC gets its own 150 s wait in the socket layer), but entering
/// PROMPT/BUFFER in the first place is always fast.
const MODE_ENTRY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotError {
    Timeout,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotOutcome {
    Ok,
    /// The bare `SEND FAIL` line: the modem's send buffer is full. Distinct
    /// from [`SlotOutcome::Error`] because the caller retries rather than
    /// tearing the socket down (§4.4 "Send").
    SendFail,
    Error(SlotError),
}

/// Outcome of a `+QISEND`/`+QSSLSEND` payload write, as distinguished from a
/// plain OK/ERROR completion (see [`SlotGuard::wait_for_send_result`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendResult {
    Sent,
    Full,
    Error(SlotError),
}

/// In-flight state of the single active AT command. Owned by the
/// [`SlotArbiter`]'s synchronous cell; mutated by both the client (at
/// acquire) and the reader loop (while filling response lines).
pub(crate) struct SlotState {
    pub command: CommandId,
    pub expected_param_lines: u8,
    pub filled_param_lines: u8,
    pub response: Vec<u8, RESPONSE_CAPACITY>,
    /// Whether the labelled response line this slot is waiting for is
    /// followed by a raw (non-line) payload the reader loop must drain into
    /// a socket's ring buffer. Defaults to the command's usual shape but can
    /// be overridden for calls that reuse a buffer-reading command id for a
    /// zero-length probe (`+QIRD=<id>,0`'s triple-count response carries no
    /// payload at all).
    expects_payload: bool,
    started_at: Instant,
    timeout: Duration,
}

impl SlotState {
    fn new(command: CommandId, expected_param_lines: u8, timeout: Duration) -> Self {
        Self {
            command,
            expected_param_lines,
            filled_param_lines: 0,
            response: Vec::new(),
            expects_payload: descriptor::spec(command).buffer_reading,
            started_at: Instant::now(),
            timeout,
        }
    }

    fn elapsed_exceeds_timeout(&self) -> bool {
        Instant::now().duration_since(self.started_at) > self.timeout
    }

    fn push_line(&mut self, line: &[u8]) -> bool {
        if !self.response.is_empty() && self.response.push(b'\n').is_err() {
            return false;
        }
        if self.response.extend_from_slice(line).is_err() {
            return false;
        }
        self.filled_param_lines += 1;
        true
    }
}

/// Serialises all AT command emissions through one slot (§4.3).
///
/// `permit` is the FIFO slot-mutex: a client's [`SlotGuard`] holds its
/// `MutexGuard` for the entire request, so a second `acquire` call blocks
/// until `release` (the guard's `Drop`). `cell` is the shared mutable
/// record the reader loop and the client both touch synchronously, in the
/// style of this crate's `ModemState::reg_state` blocking-mutex cell.
pub struct SlotArbiter {
    permit: Mutex<CriticalSectionRawMutex, ()>,
    cell: BlockingMutex<CriticalSectionRawMutex, RefCell<Option<SlotState>>>,
    done: Signal<CriticalSectionRawMutex, SlotOutcome>,
    prompt: Signal<CriticalSectionRawMutex, ()>,
    buffer: Signal<CriticalSectionRawMutex, ()>,
}

impl SlotArbiter {
    pub const fn new() -> Self {
        Self {
            permit: Mutex::new(()),
            cell: BlockingMutex::new(RefCell::new(None)),
            done: Signal::new(),
            prompt: Signal::new(),
            buffer: Signal::new(),
        }
    }

    pub async fn acquire(
        &self,
        command: CommandId,
        expected_param_lines: u8,
        timeout: Duration,
    ) -> SlotGuard<'_> {
        let permit = self.permit.lock().await;
        self.cell.lock(|c| {
            *c.borrow_mut() = Some(SlotState::new(command, expected_param_lines, timeout));
        });
        self.done.reset();
        self.prompt.reset();
        self.buffer.reset();
        SlotGuard { arbiter: self, _permit: permit }
    }

    /// True if `id` is the active slot's command — the reader loop's test
    /// for "this line belongs to the waiting client, not a bystander URC".
    pub(crate) fn is_active(&self, id: CommandId) -> bool {
        self.cell.lock(|c| c.borrow().as_ref().is_some_and(|s| s.command == id))
    }

    /// The active slot's command, if any — used to decide whether an
    /// unlabelled line (`+CMGL`'s message body) belongs to it.
    pub(crate) fn active_command(&self) -> Option<CommandId> {
        self.cell.lock(|c| c.borrow().as_ref().map(|s| s.command))
    }

    /// Overrides whether the active slot's labelled response line is
    /// followed by a raw payload (see [`SlotState::expects_payload`]).
    pub(crate) fn set_expects_payload(&self, flag: bool) {
        self.cell.lock(|c| {
            if let Some(s) = c.borrow_mut().as_mut() {
                s.expects_payload = flag;
            }
        });
    }

    pub(crate) fn expects_payload(&self) -> bool {
        self.cell.lock(|c| c.borrow().as_ref().is_some_and(|s| s.expects_payload))
    }

    pub(crate) fn has_timed_out(&self) -> bool {
        self.cell.lock(|c| c.borrow().as_ref().is_some_and(SlotState::elapsed_exceeds_timeout))
    }

    pub(crate) fn expected_lines_filled(&self) -> bool {
        self.cell.lock(|c| {
            c.borrow()
                .as_ref()
                .is_none_or(|s| s.filled_param_lines >= s.expected_param_lines)
        })
    }

    /// Appends a parsed response line to the active slot. Returns `false`
    /// if there is no active slot or the response buffer is full.
    pub(crate) fn push_response_line(&self, line: &[u8]) -> bool {
        self.cell
            .lock(|c| c.borrow_mut().as_mut().map(|s| s.push_line(line)).unwrap_or(false))
    }

    pub(crate) fn complete(&self, outcome: SlotOutcome) {
        self.done.signal(outcome);
    }

    pub(crate) fn enter_prompt(&self) {
        self.prompt.signal(());
    }

    pub(crate) fn enter_buffer(&self) {
        self.buffer.signal(());
    }
}

impl Default for SlotArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership handle for the active slot. Dropping it (or calling
/// [`SlotGuard::release`]) frees the slot-mutex for the next client.
pub struct SlotGuard<'a> {
    arbiter: &'a SlotArbiter,
    _permit: MutexGuard<'a, CriticalSectionRawMutex, ()>,
}

impl<'a> SlotGuard<'a> {
    /// See [`SlotArbiter::set_expects_payload`].
    pub(crate) fn set_expects_payload(&self, flag: bool) {
        self.arbiter.set_expects_payload(flag);
    }

    pub(crate) fn command(&self) -> CommandId {
        self.arbiter
            .cell
            .lock(|c| c.borrow().as_ref().map(|s| s.command))
            .expect("slot initialised at acquire")
    }

    /// Snapshot of the accumulated response lines, `\n`-joined.
    pub(crate) fn response(&self) -> Vec<u8, RESPONSE_CAPACITY> {
        self.arbiter
            .cell
            .lock(|c| c.borrow().as_ref().map(|s| s.response.clone()))
            .unwrap_or_default()
    }

    pub async fn wait_for_completion(&self) -> Result<(), SlotError> {
        match self.arbiter.done.wait().await {
            SlotOutcome::Ok => Ok(()),
            SlotOutcome::SendFail => Ok(()),
            SlotOutcome::Error(e) => Err(e),
        }
    }

    /// Like [`Self::wait_for_completion`] but keeps `SEND FAIL` distinct
    /// from a slot error, for `+QISEND`/`+QSSLSEND` callers that retry on a
    /// full send buffer instead of treating it as a socket failure.
    pub(crate) async fn wait_for_send_result(&self) -> SendResult {
        match self.arbiter.done.wait().await {
            SlotOutcome::Ok => SendResult::Sent,
            SlotOutcome::SendFail => SendResult::Full,
            SlotOutcome::Error(e) => SendResult::Error(e),
        }
    }

    /// Polls for PROMPT mode (cap 10 s), writes `payload` in ≤ 64-byte
    /// chunks, then `extra` (the SMS `^Z` terminator, or empty).
    pub async fn wait_for_prompt_mode<W: embedded_io_async::Write>(
        &self,
        payload: &[u8],
        extra: &[u8],
        port: &mut W,
    ) -> Result<(), SlotError> {
        with_timeout(MODE_ENTRY_TIMEOUT, self.arbiter.prompt.wait())
            .await
            .map_err(|_| SlotError::Timeout)?;
        for chunk in payload.chunks(64) {
            port.write_all(chunk).await.map_err(|_| SlotError::Invalid)?;
        }
        if !extra.is_empty() {
            port.write_all(extra).await.map_err(|_| SlotError::Invalid)?;
        }
        Ok(())
    }

    /// Polls for BUFFER mode (cap 10 s); once entered the caller owns the
    /// serial port for direct binary I/O until it signals back to NORMAL.
    pub async fn wait_for_buffer_mode(&self) -> Result<(), SlotError> {
        with_timeout(MODE_ENTRY_TIMEOUT, self.arbiter.buffer.wait())
            .await
            .map_err(|_| SlotError::Timeout)
    }

    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: core::future::Future>(f: F) -> F::Output {
        embassy_futures::block_on(f)
    }

    #[test]
    fn acquire_initialises_and_release_frees_the_permit() {
        let arbiter = SlotArbiter::new();
        block_on(async {
            let guard = arbiter.acquire(CommandId::Csq, 1, Duration::from_secs(5)).await;
            assert_eq!(guard.command(), CommandId::Csq);
            assert!(arbiter.is_active(CommandId::Csq));
            assert!(!arbiter.is_active(CommandId::Cops));
            guard.release();

            // a fresh acquire must succeed immediately now that the permit is free
            let guard2 = arbiter.acquire(CommandId::Cops, 1, Duration::from_secs(5)).await;
            assert_eq!(guard2.command(), CommandId::Cops);
        });
    }

    #[test]
    fn push_response_line_accumulates_and_signals_completion() {
        let arbiter = SlotArbiter::new();
        block_on(async {
            let guard = arbiter.acquire(CommandId::Csq, 1, Duration::from_secs(5)).await;
            assert!(arbiter.push_response_line(b"18,99"));
            assert!(arbiter.expected_lines_filled());
            arbiter.complete(SlotOutcome::Ok);
            assert_eq!(guard.response(), b"18,99".as_slice());
            guard.wait_for_completion().await.unwrap();
        });
    }

    #[test]
    fn completion_with_error_propagates_to_waiter() {
        let arbiter = SlotArbiter::new();
        block_on(async {
            let guard = arbiter.acquire(CommandId::Cmgs, 1, Duration::from_secs(5)).await;
            arbiter.complete(SlotOutcome::Error(SlotError::Invalid));
            assert_eq!(guard.wait_for_completion().await, Err(SlotError::Invalid));
        });
    }
}
