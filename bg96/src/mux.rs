//! The mode/slot scheduler (§4.2): the single long-lived reader-loop task.
//!
//! Owns the serial input exclusively. Classifies every line, routes it to
//! the active slot or the URC dispatcher, and performs the one piece of
//! raw (non-line) I/O the protocol needs — draining the payload bytes that
//! follow a `+QIRD`/`+QSSLRECV` label line directly into the socket's ring
//! buffer, since only this task ever reads from the port.

use crate::command::socket as socket_cmd;
use crate::descriptor::{self, ResponseStyle};
use crate::parser::{self, LineClass};
use crate::reader::{ReadEvent, SerialReader};
use crate::slot::{SlotArbiter, SlotError, SlotOutcome};
use crate::socket::SocketTable;
use crate::state::{GlobalState, Mode};
use crate::urc;

/// Runs until the port returns an unrecoverable I/O error. Intended to be
/// spawned once, for the lifetime of the driver, onto its own task.
pub async fn run<R: embedded_io_async::Read>(
    mut reader: SerialReader<R>,
    state: &GlobalState,
    arbiter: &SlotArbiter,
    sockets: &SocketTable,
) {
    loop {
        match reader.next_event().await {
            Ok(ReadEvent::Prompt) => {
                // §4.1/§4.2: only the send-payload commands ({QISEND,
                // QSSLSEND, CMGS}) expect this transition. A stray '>' from
                // the modem during any other command is noise, handled the
                // same way §8 treats a stray URC during PROMPT: ignored.
                if arbiter.active_command().is_some_and(|id| descriptor::spec(id).send_payload) {
                    state.set_mode(Mode::Prompt);
                    arbiter.enter_prompt();
                } else {
                    trace!("stray '>' outside a send-payload command, ignoring");
                }
            }
            Ok(ReadEvent::Line) => {
                let line = reader.line();
                match parser::classify(line) {
                    LineClass::Ok | LineClass::SendOk => {
                        state.set_mode(Mode::Normal);
                        arbiter.complete(SlotOutcome::Ok);
                    }
                    LineClass::SendFail => {
                        state.set_mode(Mode::Normal);
                        arbiter.complete(SlotOutcome::SendFail);
                    }
                    LineClass::Error => {
                        state.set_mode(Mode::Normal);
                        arbiter.complete(SlotOutcome::Error(SlotError::Invalid));
                    }
                    LineClass::CmeError(msg) => {
                        warn!("+CME ERROR: {}", msg.as_str());
                        state.set_mode(Mode::Normal);
                        arbiter.complete(SlotOutcome::Error(SlotError::Invalid));
                    }
                    LineClass::Rdy => debug!("modem RDY"),
                    // The reader already turns a leading '>' into
                    // `ReadEvent::Prompt` before a line can accumulate; this
                    // arm exists only so the match stays exhaustive.
                    LineClass::Prompt => {}
                    LineClass::Connect => {
                        // `+QFUPL`'s file-upload handshake: the client writes
                        // the raw payload itself once unblocked. Gated the
                        // same way as PROMPT above: only while QFUPL is the
                        // active slot does CONNECT mean anything.
                        if arbiter.active_command().is_some_and(|id| descriptor::spec(id).file_upload) {
                            debug!("CONNECT, entering buffer mode for file upload");
                            state.set_mode(Mode::Buffer);
                            arbiter.enter_buffer();
                        } else {
                            trace!("stray CONNECT outside file upload, ignoring");
                        }
                    }
                    LineClass::Command { id, args } => {
                        handle_command_line(&mut reader, id, args, state, arbiter, sockets).await;
                    }
                    LineClass::Unknown(raw) => {
                        // `+CMGL`'s message body arrives as its own unlabelled
                        // line, interleaved with the `+CMGL:` header lines
                        // that do classify; route it into the active
                        // iterator-style slot so callers see it at all.
                        if arbiter.active_command().is_some_and(|id| descriptor::spec(id).style == ResponseStyle::Iterator) {
                            arbiter.push_response_line(raw);
                        } else {
                            trace!("unrecognised line ({} bytes)", raw.len());
                        }
                    }
                }
            }
            Err(_) => {
                // A transient framing/IO error on the link. Nothing useful to
                // do but keep polling; a stuck port eventually times out
                // whatever slot is waiting.
                trace!("reader: I/O error on next_event");
            }
        }
    }
}

async fn handle_command_line<R: embedded_io_async::Read>(
    reader: &mut SerialReader<R>,
    id: descriptor::CommandId,
    args: &[u8],
    state: &GlobalState,
    arbiter: &SlotArbiter,
    sockets: &SocketTable,
) {
    let spec = descriptor::spec(id);
    let carries_own_response =
        matches!(spec.style, ResponseStyle::ParamLineThenOk | ResponseStyle::RawStringThenOk | ResponseStyle::Iterator);
    let is_own_response = carries_own_response && arbiter.is_active(id);

    if is_own_response {
        if spec.buffer_reading && arbiter.expects_payload() {
            read_socket_payload(reader, args, state, sockets).await;
        }
        trace!("slot response line ({} bytes)", args.len());
        arbiter.push_response_line(args);
    } else if spec.urc_bearing {
        debug!("URC dispatch");
        urc::dispatch(id, args, state, sockets);
    }
}

/// Reads the raw payload that follows a `+QIRD`/`+QSSLRECV` label line and
/// appends it to the socket the client recorded via
/// [`GlobalState::set_pending_read_socket`] before issuing the command.
async fn read_socket_payload<R: embedded_io_async::Read>(
    reader: &mut SerialReader<R>,
    args: &[u8],
    state: &GlobalState,
    sockets: &SocketTable,
) {
    let Ok(len) = socket_cmd::parse_read_header(args) else { return };
    let Some(handle) = state.take_pending_read_socket() else { return };
    if sockets.validate(handle).is_err() {
        return;
    }

    state.set_mode(Mode::Buffer);
    let mut remaining = len;
    let mut chunk = [0u8; 64];
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        if reader.read_raw(&mut chunk[..n]).await.is_err() {
            break;
        }
        sockets.push_ring(handle, &chunk[..n]);
        remaining -= n;
    }
    state.set_mode(Mode::Normal);

    if len > 0 {
        sockets.signal_rx(handle);
        state.wake_select();
    }
}

#[cfg(test)]
mod tests {
    use embassy_time::Duration;
    use heapless::Vec as HVec;

    use super::*;
    use crate::descriptor::CommandId;
    use crate::socket::Protocol;

    struct Fake {
        data: HVec<u8, 512>,
        pos: usize,
    }

    #[derive(Debug)]
    struct FakeError;
    impl embedded_io_async::Error for FakeError {
        fn kind(&self) -> embedded_io_async::ErrorKind {
            embedded_io_async::ErrorKind::Other
        }
    }
    impl embedded_io_async::ErrorType for Fake {
        type Error = FakeError;
    }
    impl embedded_io_async::Read for Fake {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data.as_slice()[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn block_on<F: core::future::Future>(f: F) -> F::Output {
        embassy_futures::block_on(f)
    }

    fn fake_from(bytes: &[u8]) -> Fake {
        let mut data = HVec::new();
        data.extend_from_slice(bytes).unwrap();
        Fake { data, pos: 0 }
    }

    fn clock() -> i64 {
        1_700_000_000
    }

    #[test]
    fn completes_a_plain_slot_on_ok() {
        let state = GlobalState::new(clock);
        let arbiter = SlotArbiter::new();
        let sockets = SocketTable::new(6);
        let reader = SerialReader::new(fake_from(b"OK\r\n"));

        block_on(async {
            let guard = arbiter.acquire(CommandId::Cfun, 0, Duration::from_secs(1)).await;
            // run one event manually instead of the infinite loop
            let mut reader = reader;
            match reader.next_event().await.unwrap() {
                ReadEvent::Line => {
                    if let LineClass::Ok = parser::classify(reader.line()) {
                        arbiter.complete(SlotOutcome::Ok);
                    }
                }
                _ => panic!("expected a line"),
            }
            guard.wait_for_completion().await.unwrap();
        });
    }

    #[test]
    fn stray_prompt_is_ignored_without_a_send_payload_slot_active() {
        let state = GlobalState::new(clock);
        let arbiter = SlotArbiter::new();

        block_on(async {
            let guard = arbiter.acquire(CommandId::Csq, 1, Duration::from_secs(1)).await;
            // Same gate as `run`'s `ReadEvent::Prompt` arm.
            if arbiter.active_command().is_some_and(|id| descriptor::spec(id).send_payload) {
                state.set_mode(Mode::Prompt);
                arbiter.enter_prompt();
            }
            drop(guard);
        });

        assert_eq!(state.mode(), Mode::Normal);
    }

    #[test]
    fn prompt_enters_prompt_mode_for_a_send_payload_slot() {
        let state = GlobalState::new(clock);
        let arbiter = SlotArbiter::new();

        block_on(async {
            let guard = arbiter.acquire(CommandId::Qisend, 1, Duration::from_secs(1)).await;
            if arbiter.active_command().is_some_and(|id| descriptor::spec(id).send_payload) {
                state.set_mode(Mode::Prompt);
                arbiter.enter_prompt();
            }
            drop(guard);
        });

        assert_eq!(state.mode(), Mode::Prompt);
    }

    #[test]
    fn stray_connect_is_ignored_outside_file_upload() {
        let state = GlobalState::new(clock);
        let arbiter = SlotArbiter::new();

        block_on(async {
            let guard = arbiter.acquire(CommandId::Cfun, 0, Duration::from_secs(1)).await;
            // Same gate as `run`'s `LineClass::Connect` arm.
            if arbiter.active_command().is_some_and(|id| descriptor::spec(id).file_upload) {
                state.set_mode(Mode::Buffer);
                arbiter.enter_buffer();
            }
            drop(guard);
        });

        assert_eq!(state.mode(), Mode::Normal);
    }

    #[test]
    fn dispatches_urc_while_no_slot_is_active() {
        let state = GlobalState::new(clock);
        let arbiter = SlotArbiter::new();
        let sockets = SocketTable::new(6);
        let h = sockets.allocate(Protocol::Tcp, false).unwrap();
        assert_eq!(h, 0);

        block_on(async {
            let mut reader = SerialReader::new(fake_from(b"+QIURC: \"closed\",0\r\n"));
            reader.next_event().await.unwrap();
            let LineClass::Command { id, args } = parser::classify(reader.line()) else {
                panic!("expected a command line")
            };
            handle_command_line(&mut reader, id, args, &state, &arbiter, &sockets).await;
        });

        assert!(sockets.is_to_be_closed(h));
    }

    #[test]
    fn unlabelled_line_joins_an_active_iterator_slot() {
        let arbiter = SlotArbiter::new();
        block_on(async {
            let guard = arbiter.acquire(CommandId::Cmgl, 0, Duration::from_secs(1)).await;
            arbiter.push_response_line(br#"1,"REC UNREAD","+15551234567",,"24/05/30,13:22:45+08""#);

            let mut reader = SerialReader::new(fake_from(b"hello world\r\n"));
            reader.next_event().await.unwrap();
            let LineClass::Unknown(raw) = parser::classify(reader.line()) else {
                panic!("expected an unlabelled line")
            };
            if arbiter.active_command().is_some_and(|id| descriptor::spec(id).style == ResponseStyle::Iterator) {
                arbiter.push_response_line(raw);
            }

            let response = guard.response();
            let text = core::str::from_utf8(&response).unwrap();
            assert!(text.ends_with("hello world"));
        });
    }

    #[test]
    fn reads_socket_payload_into_the_ring_buffer() {
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        let h = sockets.allocate(Protocol::Tcp, false).unwrap();
        state.set_pending_read_socket(h);

        block_on(async {
            let mut reader = SerialReader::new(fake_from(b"abcd"));
            read_socket_payload(&mut reader, b"4", &state, &sockets).await;
        });

        let mut out = [0u8; 4];
        assert_eq!(sockets.drain_ring(h, &mut out), 4);
        assert_eq!(&out, b"abcd");
    }
}
