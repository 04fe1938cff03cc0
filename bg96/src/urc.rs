//! URC dispatcher (§4.5). Runs on the reader loop; handlers are
//! idempotent, constant-time, and never acquire the slot mutex.

use crate::descriptor::CommandId;
use crate::parser::{ArgExtractor, Element};
use crate::socket::SocketTable;
use crate::state::{GlobalState, RegistrationDomain, RegistrationState};

/// Dispatches one already-classified URC-bearing line. `args` is the byte
/// slice after `"+NAME: "` (or, for `+QIURC`/`+QSSLURC`/`+CGEV`, the whole
/// unlabelled payload).
pub(crate) fn dispatch(id: CommandId, args: &[u8], state: &GlobalState, sockets: &SocketTable) {
    match id {
        CommandId::Cmti => dispatch_cmti(args, state),
        CommandId::Qiopen | CommandId::Qsslopen => dispatch_open(args, sockets),
        CommandId::Qiurc | CommandId::Qsslurc => dispatch_iurc(args, state, sockets),
        CommandId::Creg => dispatch_registration(RegistrationDomain::Gsm, args, state),
        CommandId::Cgreg => dispatch_registration(RegistrationDomain::Gprs, args, state),
        CommandId::Cereg => dispatch_registration(RegistrationDomain::Eps, args, state),
        CommandId::Cgev => dispatch_cgev(args, sockets),
        _ => {}
    }
}

fn ints_and_strs(args: &[u8]) -> heapless::Vec<Element<'_>, 8> {
    ArgExtractor::new(args).filter_map(Result::ok).collect()
}

fn dispatch_cmti(args: &[u8], state: &GlobalState) {
    // `+CMTI: "<storage>",<index>` — only the counter matters here.
    if ints_and_strs(args).len() >= 2 {
        state.increment_pending_sms();
    }
}

fn dispatch_open(args: &[u8], sockets: &SocketTable) {
    let fields = ints_and_strs(args);
    if let [Element::Int(id), Element::Int(status)] = fields.as_slice() {
        let handle = *id as usize;
        if sockets.validate(handle).is_ok() {
            sockets.set_connect_state(handle, *status);
        }
    }
}

/// Shared by the URC path (an unsolicited `+CREG`/`+CGREG`/`+CEREG` line)
/// and `Modem::check_network`'s direct `+CxREG?` query, which sees the same
/// field shape as its own slot response rather than through [`dispatch`].
pub(crate) fn dispatch_registration(domain: RegistrationDomain, args: &[u8], state: &GlobalState) {
    let fields = ints_and_strs(args);
    let mut iter = fields.iter();
    let Some(Element::Int(code)) = iter.next() else { return };
    let Some(reg_state) = RegistrationState::from_code(*code) else { return };

    let lac = match iter.next() {
        Some(Element::Str(s)) => Some(*s),
        _ => None,
    };
    let ci = match iter.next() {
        Some(Element::Str(s)) => Some(*s),
        _ => None,
    };
    let act = match iter.next() {
        Some(Element::Int(n)) => Some(*n),
        _ => None,
    };

    state.update_registration(domain, reg_state, lac, ci, act);
}

fn dispatch_iurc(args: &[u8], state: &GlobalState, sockets: &SocketTable) {
    let mut extractor = ArgExtractor::new(args);
    let Some(Ok(Element::Str(kind))) = extractor.next() else { return };

    match kind {
        "closed" => {
            if let Some(Ok(Element::Int(id))) = extractor.next() {
                let handle = id as usize;
                if sockets.validate(handle).is_ok() {
                    sockets.mark_to_be_closed(handle);
                }
            }
        }
        "recv" => {
            if let Some(Ok(Element::Int(id))) = extractor.next() {
                let handle = id as usize;
                if sockets.validate(handle).is_ok() {
                    sockets.signal_rx(handle);
                    state.wake_select();
                }
            }
        }
        "dnsgip" => dispatch_dnsgip(extractor, state),
        "pdpdeact" => sockets.mark_all_to_be_closed(),
        _ => {}
    }
}

fn dispatch_dnsgip(mut extractor: ArgExtractor<'_>, state: &GlobalState) {
    // First line of a resolution: `"dnsgip","0",<count>` — the `"0"` is a
    // quoted string, not an integer. Subsequent lines: `"dnsgip","<ip>"`.
    // Both arrive through this same URC id.
    match extractor.next() {
        Some(Ok(Element::Str("0"))) => {
            if let Some(Ok(Element::Int(count))) = extractor.next() {
                state.dns_begin();
                state.dns_set_expected(count as u8);
            }
        }
        Some(Ok(Element::Str(ip))) => state.dns_push_address(ip),
        _ => {}
    }
}

fn dispatch_cgev(args: &[u8], sockets: &SocketTable) {
    let text = core::str::from_utf8(args).unwrap_or("");
    if text.contains("DETACH") || text.contains("DEACT") {
        sockets.mark_all_to_be_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Protocol;

    fn clock() -> i64 {
        1_700_000_000
    }

    #[test]
    fn cmti_increments_pending_sms() {
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        dispatch(CommandId::Cmti, br#""SM",3"#, &state, &sockets);
        assert_eq!(state.pending_sms(), 1);
    }

    #[test]
    fn qiopen_urc_marks_socket_connected() {
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        let h = sockets.allocate(Protocol::Tcp, false).unwrap();
        dispatch(CommandId::Qiopen, format!("{h},0").as_bytes(), &state, &sockets);
        assert!(sockets.connect_state(h).is_some());
    }

    #[test]
    fn qiurc_closed_marks_socket_to_be_closed() {
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        let h = sockets.allocate(Protocol::Tcp, false).unwrap();
        dispatch(CommandId::Qiurc, format!(r#""closed",{h}"#).as_bytes(), &state, &sockets);
        assert!(sockets.is_to_be_closed(h));
    }

    #[test]
    fn pdpdeact_closes_every_acquired_socket() {
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        let a = sockets.allocate(Protocol::Tcp, false).unwrap();
        let b = sockets.allocate(Protocol::Udp, false).unwrap();
        dispatch(CommandId::Qiurc, br#""pdpdeact""#, &state, &sockets);
        assert!(sockets.is_to_be_closed(a));
        assert!(sockets.is_to_be_closed(b));
    }

    #[test]
    fn dns_multi_ip_sequence_resolves_to_first_address() {
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        dispatch(CommandId::Qiurc, br#""dnsgip","0",3"#, &state, &sockets);
        dispatch(CommandId::Qiurc, br#""dnsgip","1.2.3.4""#, &state, &sockets);
        dispatch(CommandId::Qiurc, br#""dnsgip","5.6.7.8""#, &state, &sockets);
        dispatch(CommandId::Qiurc, br#""dnsgip","9.10.11.12""#, &state, &sockets);
        assert_eq!(state.dns_address().as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn cgev_detach_closes_all_sockets() {
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        let h = sockets.allocate(Protocol::Tcp, false).unwrap();
        dispatch(CommandId::Cgev, b"ME DETACH", &state, &sockets);
        assert!(sockets.is_to_be_closed(h));
    }

    #[test]
    fn registration_urc_updates_aggregate_state() {
        let state = GlobalState::new(clock);
        let sockets = SocketTable::new(6);
        dispatch(CommandId::Cereg, br#"1,"1A2B","CD01",8"#, &state, &sockets);
        let info = state.network_info();
        assert_eq!(info.registered, Some(RegistrationState::RegisteredHome));
        assert_eq!(&info.lac[..], "1A2B");
    }
}
