//! SMS storage and send/list/read/delete formatting (§4.6, §6).

use core::fmt::Write as _;

use heapless::{String, Vec};

use crate::error::Error;
use crate::parser::{ArgExtractor, Element};

/// One row of a `+CMGL`/`+CMGR` listing.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SmsEntry {
    pub index: u16,
    pub status: String<16>,
    pub sender: String<20>,
    pub text: String<160>,
}

pub fn format_set_text_mode() -> &'static str {
    "+CMGF=1"
}

pub fn format_set_sms_service_center(number: &str) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+CSCA=\"{number}\"");
    out
}

pub fn format_select_storage() -> &'static str {
    r#"+CPMS="SM","SM","SM""#
}

/// `+CMGS=<number>` issues a prompt-mode command: the caller writes the
/// body text followed by Ctrl-Z once the `>` prompt arrives (§4.3).
pub fn format_send(number: &str) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+CMGS=\"{number}\"");
    out
}

pub fn format_list(filter: &str) -> String<24> {
    let mut out = String::new();
    let _ = write!(out, "+CMGL=\"{filter}\"");
    out
}

pub fn format_read(index: u16) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+CMGR={index}");
    out
}

pub fn format_delete(index: u16) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+CMGD={index}");
    out
}

/// Parses one `+CMGL: <index>,"<status>","<sender>",,"<ts>"` header line;
/// the message body itself is the following raw line, handed in separately
/// because it is never comma-delimited.
///
/// Quoted fields don't consume their trailing separator, so every quoted
/// field is followed by a spurious empty element; collecting only the `Ok`
/// elements (as [`crate::urc`]'s dispatchers do) skips over those for free.
pub fn parse_list_header(args: &[u8], body: &str) -> Result<SmsEntry, Error> {
    let fields: heapless::Vec<Element<'_>, 6> = ArgExtractor::new(args).filter_map(Result::ok).collect();
    let mut it = fields.into_iter();

    let Some(Element::Int(index)) = it.next() else { return Err(Error::TypeError) };
    let status = match it.next() {
        Some(Element::Str(s)) => String::try_from(s).unwrap_or_default(),
        _ => return Err(Error::TypeError),
    };
    let sender = match it.next() {
        Some(Element::Str(s)) => String::try_from(s).unwrap_or_default(),
        _ => String::new(),
    };

    Ok(SmsEntry {
        index: index as u16,
        status,
        sender,
        text: String::try_from(body).unwrap_or_default(),
    })
}

/// Parses the `+CMGS: <index>` acknowledgement after a successful send.
pub fn parse_send_ack(args: &[u8]) -> Result<u16, Error> {
    let mut it = ArgExtractor::new(args);
    match it.next() {
        Some(Ok(Element::Int(index))) => Ok(index as u16),
        _ => Err(Error::TypeError),
    }
}

/// Walks a `+CMGL` response's alternating header/body lines, keeping only
/// received messages (READ/UNREAD) — stored drafts/sent copies ("STO
/// SENT"/"STO UNSENT") are dropped even under the "ALL" filter — and
/// applying `offset`/`max` over the surviving entries (§4.6 "sms_list").
pub fn accumulate_list(text: &str, max: usize, offset: usize) -> Vec<SmsEntry, 8> {
    let mut out = Vec::new();
    let mut lines = text.split('\n');
    let mut seen = 0usize;
    while let (Some(header), Some(body)) = (lines.next(), lines.next()) {
        let Ok(entry) = parse_list_header(header.as_bytes(), body) else { continue };
        if !entry.status.starts_with("REC") {
            continue;
        }
        if seen >= offset && out.len() < max {
            if out.push(entry).is_err() {
                break;
            }
        }
        seen += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_send_and_list() {
        assert_eq!(&format_send("+15551234567")[..], "+CMGS=\"+15551234567\"");
        assert_eq!(&format_list("ALL")[..], "+CMGL=\"ALL\"");
    }

    #[test]
    fn parses_list_header_with_body() {
        let entry = parse_list_header(br#"1,"REC UNREAD","+15551234567",,"24/05/30,13:22:45+08""#, "hello").unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(&entry.status[..], "REC UNREAD");
        assert_eq!(&entry.sender[..], "+15551234567");
        assert_eq!(&entry.text[..], "hello");
    }

    #[test]
    fn parses_send_acknowledgement() {
        assert_eq!(parse_send_ack(b"17").unwrap(), 17);
    }

    #[test]
    fn accumulate_list_drops_stored_drafts_under_the_all_filter() {
        let text = concat!(
            "1,\"REC UNREAD\",\"+15551234567\",,\"24/05/30,13:22:45+08\"\nhello\n",
            "2,\"STO UNSENT\",\"\",,\"24/05/30,13:23:00+08\"\ndraft\n",
            "3,\"REC READ\",\"+15557654321\",,\"24/05/30,13:24:00+08\"\nbye",
        );
        let out = accumulate_list(text, 8, 0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].index, 1);
        assert_eq!(out[1].index, 3);
    }

    #[test]
    fn accumulate_list_applies_offset_and_max_after_filtering() {
        let text = concat!(
            "1,\"REC READ\",\"+1\",,\"24/05/30,13:00:00+08\"\na\n",
            "2,\"STO SENT\",\"\",,\"24/05/30,13:01:00+08\"\nb\n",
            "3,\"REC READ\",\"+3\",,\"24/05/30,13:02:00+08\"\nc\n",
            "4,\"REC UNREAD\",\"+4\",,\"24/05/30,13:03:00+08\"\nd\n",
        );
        let out = accumulate_list(text, 1, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].index, 3);
    }
}
