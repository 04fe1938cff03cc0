//! Network registration and operator selection (§4.6).
//!
//! Request-side `+CREG`/`+CGREG`/`+CEREG`/`+COPS` formatting; the
//! response-side registration updates arrive as URCs and are handled by
//! [`crate::urc`] directly against [`crate::state::GlobalState`].

use core::fmt::Write as _;

use heapless::{String, Vec};

use crate::error::Error;
use crate::parser::{ArgExtractor, Element};
use crate::state::{OperatorEntry, RegistrationDomain};

fn domain_name(domain: RegistrationDomain) -> &'static str {
    match domain {
        RegistrationDomain::Gsm => "CREG",
        RegistrationDomain::Gprs => "CGREG",
        RegistrationDomain::Eps => "CEREG",
    }
}

/// Enables unsolicited `<n>=2` registration URCs (with location info).
pub fn format_enable_registration_urc(domain: RegistrationDomain) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+{}=2", domain_name(domain));
    out
}

pub fn format_query_registration(domain: RegistrationDomain) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+{}?", domain_name(domain));
    out
}

pub fn format_set_operator_auto() -> &'static str {
    "+COPS=0"
}

pub fn format_set_operator_manual(format: u8, oper: &str) -> String<48> {
    let mut out = String::new();
    let _ = write!(out, "+COPS=1,{format},\"{oper}\"");
    out
}

pub fn format_get_operator() -> &'static str {
    "+COPS?"
}

pub fn format_list_operators() -> &'static str {
    "+COPS=?"
}

/// Parses a `+COPS=?` test-command response: a parenthesised list of
/// `(stat,"long","short",numeric,act)` tuples, trailing lists of supported
/// `<mode>`/`<format>` dropped.
pub fn parse_operator_list(args: &[u8]) -> Result<Vec<OperatorEntry, 6>, Error> {
    let text = core::str::from_utf8(args).map_err(|_| Error::TypeError)?;
    let mut out = Vec::new();

    let mut rest = text;
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else { break };
        let body = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        // Quoted fields don't consume their trailing separator, so each one
        // is followed by a spurious empty element; collecting only the `Ok`
        // elements skips over those for free.
        let fields: Vec<Element<'_>, 8> = ArgExtractor::new(body.as_bytes()).filter_map(Result::ok).collect();
        let mut it = fields.into_iter();

        let Some(Element::Int(stat)) = it.next() else { continue };
        let long_name = match it.next() {
            Some(Element::Str(s)) => String::try_from(s).unwrap_or_default(),
            _ => String::new(),
        };
        let short_name = match it.next() {
            Some(Element::Str(s)) => String::try_from(s).unwrap_or_default(),
            _ => String::new(),
        };
        let numeric = match it.next() {
            Some(Element::Str(s)) => String::try_from(s).unwrap_or_default(),
            Some(Element::Int(n)) => {
                let mut s = String::new();
                let _ = write!(s, "{n}");
                s
            }
            _ => String::new(),
        };

        if out.push(OperatorEntry { stat: stat as u8, long_name, short_name, numeric }).is_err() {
            break;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_registration_commands() {
        assert_eq!(&format_enable_registration_urc(RegistrationDomain::Eps)[..], "+CEREG=2");
        assert_eq!(&format_query_registration(RegistrationDomain::Gsm)[..], "+CREG?");
    }

    #[test]
    fn formats_manual_operator_selection() {
        assert_eq!(&format_set_operator_manual(2, "26201")[..], "+COPS=1,2,\"26201\"");
    }

    #[test]
    fn parses_operator_list_with_multiple_entries() {
        let line = br#"(2,"Vodafone","VOD","26202",2),(1,"Telekom","DTE","26201",7)"#;
        let entries = parse_operator_list(line).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(&entries[0].long_name[..], "Vodafone");
        assert_eq!(entries[0].stat, 2);
        assert_eq!(&entries[1].numeric[..], "26201");
    }
}
