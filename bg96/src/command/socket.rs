//! Plain TCP/UDP socket lifecycle and DNS formatting (§4.6, §6).

use core::fmt::Write as _;

use heapless::String;

use crate::error::Error;
use crate::parser::{ArgExtractor, Element};
use crate::socket::Protocol;

pub fn format_open(
    pdp_context: u8,
    socket_index: usize,
    protocol: Protocol,
    host: &str,
    port: u16,
    local_port: u16,
) -> String<96> {
    let service = match protocol {
        Protocol::Tcp => "TCP",
        Protocol::Udp => "UDP",
    };
    let mut out = String::new();
    let _ = write!(out, "+QIOPEN={pdp_context},{socket_index},\"{service}\",\"{host}\",{port},{local_port},0");
    out
}

/// `+QIOPEN`'s `"UDP SERVICE"` form, used only by `bind`: binds a local port
/// without a fixed remote peer.
pub fn format_bind(pdp_context: u8, socket_index: usize, local_port: u16) -> String<96> {
    let mut out = String::new();
    let _ = write!(
        out,
        "+QIOPEN={pdp_context},{socket_index},\"UDP SERVICE\",\"127.0.0.1\",0,{local_port},0"
    );
    out
}

/// `timeout_s` is the graceful-close deadline (§4.4 "Close"); the modem
/// forces the socket shut once it elapses even with data still pending.
pub fn format_close(socket_index: usize, timeout_s: u8) -> String<24> {
    let mut out = String::new();
    let _ = write!(out, "+QICLOSE={socket_index},{timeout_s}");
    out
}

/// `+QISEND` is a send-payload command: the slot arbiter awaits `>` before
/// writing `len` bytes of payload.
pub fn format_send(socket_index: usize, len: usize) -> String<24> {
    let mut out = String::new();
    let _ = write!(out, "+QISEND={socket_index},{len}");
    out
}

/// `+QISEND` with a destination: used for `sendto` on UDP sockets.
pub fn format_sendto(socket_index: usize, len: usize, host: &str, port: u16) -> String<64> {
    let mut out = String::new();
    let _ = write!(out, "+QISEND={socket_index},{len},\"{host}\",{port}");
    out
}

pub fn format_read(socket_index: usize, max_len: usize) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+QIRD={socket_index},{max_len}");
    out
}

/// `+QIRD=<id>,0` is the "how much is available" probe: its response carries
/// no raw payload, just `<total_received>,<already_read>,<to_be_read>`.
pub fn format_available(socket_index: usize) -> String<32> {
    format_read(socket_index, 0)
}

/// Parses the `<total_received>,<already_read>,<to_be_read>` triple
/// returned by the zero-length "available" probe.
pub fn parse_available(args: &[u8]) -> Result<usize, Error> {
    let mut it = ArgExtractor::new(args);
    let Some(Ok(Element::Int(_total))) = it.next() else { return Err(Error::TypeError) };
    let Some(Ok(Element::Int(_read))) = it.next() else { return Err(Error::TypeError) };
    match it.next() {
        Some(Ok(Element::Int(remain))) if remain >= 0 => Ok(remain as usize),
        _ => Err(Error::TypeError),
    }
}

/// `+QISEND=<id>,0` queries the send queue instead of writing a payload: its
/// response is `+QISEND: <total_sent>,<acked>,<unacked>`. `isalive` reads the
/// unacked count — a closed socket reports `0` here even with data in
/// flight, since the stack has already given up retransmitting it.
pub fn format_send_status(socket_index: usize) -> String<24> {
    format_send(socket_index, 0)
}

pub fn parse_send_status(args: &[u8]) -> Result<usize, Error> {
    let mut it = ArgExtractor::new(args);
    let Some(Ok(Element::Int(_total))) = it.next() else { return Err(Error::TypeError) };
    let Some(Ok(Element::Int(_acked))) = it.next() else { return Err(Error::TypeError) };
    match it.next() {
        Some(Ok(Element::Int(unacked))) if unacked >= 0 => Ok(unacked as usize),
        _ => Err(Error::TypeError),
    }
}

pub fn format_resolve(pdp_context: u8, hostname: &str) -> String<160> {
    let mut out = String::new();
    let _ = write!(out, "+QIDNSGIP={pdp_context},\"{hostname}\"");
    out
}

pub fn format_configure_dns(pdp_context: u8, primary: &str, secondary: &str) -> String<96> {
    let mut out = String::new();
    let _ = write!(out, "+QIDNSCFG={pdp_context},\"{primary}\",\"{secondary}\"");
    out
}

/// Parses the leading `+QIRD: <len>` header; the payload bytes follow on
/// the next raw (non-CRLF-terminated) read.
pub fn parse_read_header(args: &[u8]) -> Result<usize, Error> {
    let mut it = ArgExtractor::new(args);
    match it.next() {
        Some(Ok(Element::Int(len))) if len >= 0 => Ok(len as usize),
        _ => Err(Error::TypeError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_tcp_open() {
        let line = format_open(1, 0, Protocol::Tcp, "example.com", 443, 0);
        assert_eq!(&line[..], "+QIOPEN=1,0,\"TCP\",\"example.com\",443,0,0");
    }

    #[test]
    fn formats_udp_bind() {
        assert_eq!(&format_bind(1, 0, 5000)[..], r#"+QIOPEN=1,0,"UDP SERVICE","127.0.0.1",0,5000,0"#);
    }

    #[test]
    fn formats_udp_sendto() {
        assert_eq!(&format_sendto(1, 64, "10.0.0.1", 5000)[..], "+QISEND=1,64,\"10.0.0.1\",5000");
    }

    #[test]
    fn parses_read_header_length() {
        assert_eq!(parse_read_header(b"42").unwrap(), 42);
    }

    #[test]
    fn formats_and_parses_the_available_probe() {
        assert_eq!(&format_available(2)[..], "+QIRD=2,0");
        assert_eq!(parse_available(b"100,60,40").unwrap(), 40);
    }

    #[test]
    fn formats_and_parses_the_send_status_probe() {
        assert_eq!(&format_send_status(2)[..], "+QISEND=2,0");
        assert_eq!(parse_send_status(b"100,100,0").unwrap(), 0);
    }
}
