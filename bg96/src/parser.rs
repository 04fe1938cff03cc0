//! Line classification and the comma/CRLF argument extractor (§4.1).

use crate::descriptor::{self, CommandId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    BadInt,
    UnterminatedString,
}

/// What the reader decided the current accumulator line is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass<'a> {
    Ok,
    Rdy,
    CmeError(heapless::String<32>),
    Error,
    /// First byte is `>`; only a mode transition if the active slot's
    /// command belongs to the send-payload set (checked by the caller).
    Prompt,
    /// `CONNECT` — only meaningful while the active slot is a file upload.
    Connect,
    /// `SEND OK` / `SEND FAIL` bare lines that terminate `+QISEND`/`+QSSLSEND`.
    SendOk,
    SendFail,
    /// A recognised `+NAME:` line; `args` is the byte slice after `: `.
    Command { id: CommandId, args: &'a [u8] },
    /// No descriptor matched; `line` is handed to the caller for raw use
    /// (GSN/ICCID-style bare strings) or ignored.
    Unknown(&'a [u8]),
}

/// Classify a single CRLF-stripped line.
pub fn classify(line: &[u8]) -> LineClass<'_> {
    if line == b"OK" {
        return LineClass::Ok;
    }
    if line == b"RDY" {
        return LineClass::Rdy;
    }
    if line == b"ERROR" {
        return LineClass::Error;
    }
    if line == b"CONNECT" {
        return LineClass::Connect;
    }
    if line == b"SEND OK" {
        return LineClass::SendOk;
    }
    if line == b"SEND FAIL" {
        return LineClass::SendFail;
    }
    if line.starts_with(b">") {
        return LineClass::Prompt;
    }
    if let Some(rest) = line.strip_prefix(b"+CME ERROR:") {
        let rest = trim_leading_space(rest);
        let mut msg = heapless::String::<32>::new();
        let text = core::str::from_utf8(rest).unwrap_or("");
        let _ = msg.push_str(&text[..text.len().min(32)]);
        return LineClass::CmeError(msg);
    }
    if let Some(id) = descriptor::classify(line) {
        let body_len = descriptor::DESCRIPTOR_TABLE
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.body.len())
            .unwrap_or(0);
        let after_colon = &line[body_len + 1..];
        let args = trim_leading_space(after_colon);
        return LineClass::Command { id, args };
    }
    LineClass::Unknown(line)
}

fn trim_leading_space(buf: &[u8]) -> &[u8] {
    if buf.first() == Some(&b' ') { &buf[1..] } else { buf }
}

/// A single parsed argument: a signed decimal integer, or a (quoted or
/// unquoted) string slice into the original accumulator — never copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element<'a> {
    Int(i64),
    Str(&'a str),
}

/// Iterates a comma-delimited argument list, stopping at end-of-slice.
///
/// Quoted strings may contain commas; unquoted strings and integers end at
/// the next comma or end-of-input. Spaces between digits of an integer
/// (`"1 2"`) are permitted and simply skipped, matching modems that pad
/// numeric fields.
pub struct ArgExtractor<'a> {
    rest: &'a [u8],
    done: bool,
}

impl<'a> ArgExtractor<'a> {
    pub fn new(args: &'a [u8]) -> Self {
        Self { rest: args, done: args.is_empty() }
    }
}

impl<'a> Iterator for ArgExtractor<'a> {
    type Item = Result<Element<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let buf = self.rest;
        if buf.is_empty() {
            self.done = true;
            return None;
        }
        if buf[0] == b'"' {
            match buf[1..].iter().position(|&b| b == b'"') {
                Some(end) => {
                    let s = &buf[1..1 + end];
                    let mut after = &buf[1 + end + 1..];
                    if after.first() == Some(&b',') {
                        after = &after[1..];
                    }
                    self.advance(after);
                    let text = match core::str::from_utf8(s) {
                        Ok(t) => t,
                        Err(_) => return Some(Err(ParseError::BadInt)),
                    };
                    Some(Ok(Element::Str(text)))
                }
                None => {
                    self.done = true;
                    Some(Err(ParseError::UnterminatedString))
                }
            }
        } else {
            let end = buf.iter().position(|&b| b == b',').unwrap_or(buf.len());
            let field = &buf[..end];
            let after = if end < buf.len() { &buf[end + 1..] } else { &buf[buf.len()..] };
            self.advance(after);

            if field.is_empty() {
                return Some(Err(ParseError::Empty));
            }
            // Unquoted non-numeric fields (e.g. the lone word in a URC) are
            // surfaced as strings; otherwise parse as a signed integer,
            // tolerating embedded spaces.
            let mut cleaned = heapless::Vec::<u8, 32>::new();
            let mut looks_numeric = true;
            for &b in field {
                if b == b' ' {
                    continue;
                }
                if !(b.is_ascii_digit() || b == b'-' || b == b'+') {
                    looks_numeric = false;
                }
                if cleaned.push(b).is_err() {
                    looks_numeric = false;
                    break;
                }
            }
            if looks_numeric && !cleaned.is_empty() {
                let s = core::str::from_utf8(&cleaned).unwrap_or("");
                match s.parse::<i64>() {
                    Ok(n) => Some(Ok(Element::Int(n))),
                    Err(_) => Some(Err(ParseError::BadInt)),
                }
            } else {
                match core::str::from_utf8(field) {
                    Ok(t) => Some(Ok(Element::Str(t))),
                    Err(_) => Some(Err(ParseError::BadInt)),
                }
            }
        }
    }
}

impl<'a> ArgExtractor<'a> {
    fn advance(&mut self, after: &'a [u8]) {
        self.rest = after;
        if after.is_empty() {
            self.done = true;
        }
    }
}

/// Render `(position, Element)` pairs into an AT argument list in the same
/// comma-delimited, quoted-string shape the extractor above consumes.
/// Exercised by the parser round-trip law in the testable-properties list.
pub fn serialize_args<'a>(
    elements: impl Iterator<Item = Element<'a>>,
    out: &mut heapless::String<256>,
) -> Result<(), ParseError> {
    let mut first = true;
    for el in elements {
        if !first {
            out.push(',').map_err(|_| ParseError::BadInt)?;
        }
        first = false;
        match el {
            Element::Int(n) => {
                let mut buf = heapless::String::<24>::new();
                write_i64(&mut buf, n);
                out.push_str(&buf).map_err(|_| ParseError::BadInt)?;
            }
            Element::Str(s) => {
                out.push('"').map_err(|_| ParseError::BadInt)?;
                out.push_str(s).map_err(|_| ParseError::BadInt)?;
                out.push('"').map_err(|_| ParseError::BadInt)?;
            }
        }
    }
    Ok(())
}

fn write_i64(out: &mut heapless::String<24>, mut n: i64) {
    if n == 0 {
        let _ = out.push('0');
        return;
    }
    if n < 0 {
        let _ = out.push('-');
    }
    let mut digits = heapless::Vec::<u8, 24>::new();
    let neg = n < 0;
    if neg {
        // avoid overflow on i64::MIN by working in i128
        let mut m = -(n as i128);
        while m > 0 {
            let _ = digits.push(b'0' + (m % 10) as u8);
            m /= 10;
        }
    } else {
        while n > 0 {
            let _ = digits.push(b'0' + (n % 10) as u8);
            n /= 10;
        }
    }
    for &d in digits.iter().rev() {
        let _ = out.push(d as char);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ok_and_error() {
        assert_eq!(classify(b"OK"), LineClass::Ok);
        assert_eq!(classify(b"OKAY"), LineClass::Unknown(b"OKAY"));
        assert_eq!(classify(b"ERROR"), LineClass::Error);
        assert_eq!(classify(b"RDY"), LineClass::Rdy);
    }

    #[test]
    fn classifies_cme_error_with_message() {
        match classify(b"+CME ERROR: operation not allowed") {
            LineClass::CmeError(msg) => assert_eq!(&msg[..], "operation not allowed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_labelled_command_line() {
        match classify(b"+CSQ: 18,99") {
            LineClass::Command { id, args } => {
                assert_eq!(id, CommandId::Csq);
                assert_eq!(args, b"18,99");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn send_result_lines_are_bare() {
        assert_eq!(classify(b"SEND OK"), LineClass::SendOk);
        assert_eq!(classify(b"SEND FAIL"), LineClass::SendFail);
    }

    #[test]
    fn extractor_yields_ints_and_quoted_strings() {
        let mut it = ArgExtractor::new(br#"1,"hello, world",-7"#);
        assert_eq!(it.next(), Some(Ok(Element::Int(1))));
        assert_eq!(it.next(), Some(Ok(Element::Str("hello, world"))));
        assert_eq!(it.next(), Some(Ok(Element::Int(-7))));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn extractor_tolerates_spaces_in_integers() {
        let mut it = ArgExtractor::new(b"1 2,3");
        assert_eq!(it.next(), Some(Ok(Element::Int(12))));
        assert_eq!(it.next(), Some(Ok(Element::Int(3))));
    }

    #[test]
    fn round_trips_integers_and_strings() {
        let elements = [Element::Int(42), Element::Str("abc"), Element::Int(-3)];
        let mut out = heapless::String::<256>::new();
        serialize_args(elements.iter().copied(), &mut out).unwrap();
        assert_eq!(&out[..], r#"42,"abc",-3"#);

        let parsed: heapless::Vec<Element, 8> =
            ArgExtractor::new(out.as_bytes()).map(|r| r.unwrap()).collect();
        assert_eq!(parsed.as_slice(), &elements);
    }
}
