//! PDP context and packet-domain attach formatting (§4.6).

use core::fmt::Write as _;

use heapless::String;

use crate::config::AuthMethod;

pub fn format_define_context(cid: u8, apn: &str) -> String<96> {
    let mut out = String::new();
    let _ = write!(out, "+CGDCONT={cid},\"IP\",\"{apn}\"");
    out
}

/// `+QICSGP` sets the TCP/IP context's APN and credentials in one shot,
/// independent of `+CGDCONT` (§6).
pub fn format_set_tcpip_context(
    cid: u8,
    apn: &str,
    user: &str,
    password: &str,
    auth: AuthMethod,
) -> String<160> {
    let mut out = String::new();
    let _ = write!(out, "+QICSGP={cid},1,\"{apn}\",\"{user}\",\"{password}\",{}", auth as u8);
    out
}

pub fn format_activate_context(cid: u8) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+QIACT={cid}");
    out
}

pub fn format_deactivate_context(cid: u8) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+QIDEACT={cid}");
    out
}

pub fn format_query_attach() -> &'static str {
    "+CGATT?"
}

pub fn format_set_attach(attached: bool) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+CGATT={}", if attached { 1 } else { 0 });
    out
}

pub fn format_enable_packet_domain_event_reporting() -> &'static str {
    "+CGEREP=1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_define_context() {
        assert_eq!(&format_define_context(1, "iot.example")[..], "+CGDCONT=1,\"IP\",\"iot.example\"");
    }

    #[test]
    fn formats_tcpip_context_with_credentials() {
        let line = format_set_tcpip_context(1, "iot.example", "user", "pass", AuthMethod::Chap);
        assert_eq!(&line[..], "+QICSGP=1,1,\"iot.example\",\"user\",\"pass\",2");
    }

    #[test]
    fn formats_activate_and_deactivate() {
        assert_eq!(&format_activate_context(1)[..], "+QIACT=1");
        assert_eq!(&format_deactivate_context(1)[..], "+QIDEACT=1");
    }
}
