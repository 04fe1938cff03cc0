//! TLS socket lifecycle and credential-file provisioning (§4.6, §6).

use core::fmt::Write as _;

use heapless::String;

/// Credential filenames on the modem's own filesystem, named by the ASCII
/// digit of the socket index they're provisioned for (§6).
pub fn ca_cert_filename(socket_index: usize) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "cacert{socket_index}.pem");
    out
}

pub fn client_cert_filename(socket_index: usize) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "clicrt{socket_index}.pem");
    out
}

pub fn private_key_filename(socket_index: usize) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "prvkey{socket_index}.pem");
    out
}

/// `+QFUPL` switches into a binary stream after `CONNECT`; the caller then
/// writes exactly `len` bytes and the slot arbiter returns to line mode on
/// the trailing `OK`. `5` is the modem's own upload-ack timeout in seconds;
/// the trailing `0` selects plain (non-base64) transfer.
pub fn format_upload_file(filename: &str, len: usize) -> String<48> {
    let mut out = String::new();
    let _ = write!(out, "+QFUPL=\"{filename}\",{len},5,0");
    out
}

pub fn format_delete_file(filename: &str) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+QFDEL=\"{filename}\"");
    out
}

/// Associates the CA cert, client cert and private key files with a
/// security-context id used by `+QSSLOPEN`.
pub fn format_configure_context(context_id: u8, socket_index: usize) -> String<96> {
    let mut out = String::new();
    let _ = write!(
        out,
        "+QSSLCFG=\"cacert\",{context_id},\"{}\"",
        ca_cert_filename(socket_index)
    );
    out
}

pub fn format_configure_client_cert(context_id: u8, socket_index: usize) -> String<96> {
    let mut out = String::new();
    let _ = write!(
        out,
        "+QSSLCFG=\"clientcert\",{context_id},\"{}\"",
        client_cert_filename(socket_index)
    );
    out
}

pub fn format_configure_client_key(context_id: u8, socket_index: usize) -> String<96> {
    let mut out = String::new();
    let _ = write!(
        out,
        "+QSSLCFG=\"clientkey\",{context_id},\"{}\"",
        private_key_filename(socket_index)
    );
    out
}

pub fn format_open(pdp_context: u8, socket_index: usize, security_context: u8, host: &str, port: u16) -> String<96> {
    let mut out = String::new();
    let _ = write!(out, "+QSSLOPEN={pdp_context},{security_context},{socket_index},\"{host}\",{port},0");
    out
}

pub fn format_close(socket_index: usize, timeout_s: u8) -> String<24> {
    let mut out = String::new();
    let _ = write!(out, "+QSSLCLOSE={socket_index},{timeout_s}");
    out
}

/// Pins TLS 1.2 (`sslversion` value `3`), the one version this driver
/// provisions for.
pub fn format_set_ssl_version(context_id: u8) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+QSSLCFG=\"sslversion\",{context_id},3");
    out
}

/// `0XFFFF` leaves cipher selection to the modem's full supported set.
pub fn format_set_cipher_suite(context_id: u8) -> String<40> {
    let mut out = String::new();
    let _ = write!(out, "+QSSLCFG=\"ciphersuite\",{context_id},0XFFFF");
    out
}

/// `level` 0 = no authentication, 1 = server auth only, 2 = mutual auth.
pub fn format_set_security_level(context_id: u8, level: u8) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+QSSLCFG=\"seclevel\",{context_id},{level}");
    out
}

pub fn format_set_ignore_local_time(context_id: u8) -> String<40> {
    let mut out = String::new();
    let _ = write!(out, "+QSSLCFG=\"ignorelocaltime\",{context_id},1");
    out
}

/// `+QSSLSEND` is a send-payload ("raw-string-only") command: the slot
/// arbiter awaits `>` before writing `data`.
pub fn format_send(socket_index: usize, len: usize) -> String<24> {
    let mut out = String::new();
    let _ = write!(out, "+QSSLSEND={socket_index},{len}");
    out
}

pub fn format_recv(socket_index: usize, max_len: usize) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+QSSLRECV={socket_index},{max_len}");
    out
}
