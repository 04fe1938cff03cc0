//! Byte-level framing over the serial transport (§4.1 "SerialReader").
//!
//! Wraps any [`embedded_io_async::Read`] and turns its byte stream into the
//! two shapes the mode/slot scheduler cares about: a CRLF-terminated line,
//! or the bare `>` prompt marker BG96 sends (with a trailing space, no
//! CRLF) when it is ready for a PROMPT-mode payload.

use crate::error::Error;
use heapless::Vec;

/// Max accumulated line length. `+QCFG`/`+QENG` responses and AT command
/// echoes stay well under this; anything longer is treated as a framing
/// error rather than silently truncated.
pub const LINE_CAPACITY: usize = 1024;

/// BG96 can emit a handful of stray NUL bytes right after power-up, before
/// the first `RDY`. Skip them at the start of a line; a run longer than
/// this is treated as a dead or miswired UART rather than retried forever.
const MAX_LEADING_NULS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete line is available via [`SerialReader::line`].
    Line,
    /// The modem is ready for a PROMPT-mode payload write.
    Prompt,
}

pub struct SerialReader<R> {
    port: R,
    buf: Vec<u8, LINE_CAPACITY>,
}

impl<R: embedded_io_async::Read> SerialReader<R> {
    pub fn new(port: R) -> Self {
        Self { port, buf: Vec::new() }
    }

    /// The most recently completed line, CR/LF already stripped.
    pub fn line(&self) -> &[u8] {
        &self.buf
    }

    /// Read until a full line or the prompt marker arrives.
    pub async fn next_event(&mut self) -> Result<ReadEvent, Error> {
        self.buf.clear();
        let mut leading_nuls = 0usize;
        let mut byte = [0u8; 1];
        loop {
            self.port.read_exact(&mut byte).await.map_err(|_| Error::IoError)?;
            let b = byte[0];

            if self.buf.is_empty() && b == 0 {
                leading_nuls += 1;
                if leading_nuls > MAX_LEADING_NULS {
                    return Err(Error::IoError);
                }
                continue;
            }

            if self.buf.is_empty() && b == b'>' {
                // Quectel always follows the marker with a single space.
                self.port.read_exact(&mut byte).await.map_err(|_| Error::IoError)?;
                return Ok(ReadEvent::Prompt);
            }

            if b == b'\n' {
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                if self.buf.is_empty() {
                    // blank CRLF between responses, keep reading
                    continue;
                }
                return Ok(ReadEvent::Line);
            }

            self.buf.push(b).map_err(|_| Error::IoError)?;
        }
    }

    /// Read exactly `out.len()` raw bytes, used for BUFFER-mode socket data
    /// that follows a `+QIRD`/`+QSSLRECV` labelled response line.
    pub async fn read_raw(&mut self, out: &mut [u8]) -> Result<(), Error> {
        self.port.read_exact(out).await.map_err(|_| Error::IoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io_async::ErrorType;

    struct Fake<'a> {
        data: &'a [u8],
        pos: usize,
    }

    #[derive(Debug)]
    struct FakeError;
    impl embedded_io_async::Error for FakeError {
        fn kind(&self) -> embedded_io_async::ErrorKind {
            embedded_io_async::ErrorKind::Other
        }
    }

    impl<'a> ErrorType for Fake<'a> {
        type Error = FakeError;
    }

    impl<'a> embedded_io_async::Read for Fake<'a> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn block_on<F: core::future::Future>(f: F) -> F::Output {
        embassy_futures::block_on(f)
    }

    #[test]
    fn reads_a_plain_line() {
        let fake = Fake { data: b"+CSQ: 18,99\r\n", pos: 0 };
        let mut reader = SerialReader::new(fake);
        let event = block_on(reader.next_event()).unwrap();
        assert_eq!(event, ReadEvent::Line);
        assert_eq!(reader.line(), b"+CSQ: 18,99");
    }

    #[test]
    fn skips_leading_nuls_and_blank_lines() {
        let fake = Fake { data: b"\0\0\0\r\n\r\nOK\r\n", pos: 0 };
        let mut reader = SerialReader::new(fake);
        let event = block_on(reader.next_event()).unwrap();
        assert_eq!(event, ReadEvent::Line);
        assert_eq!(reader.line(), b"OK");
    }

    #[test]
    fn detects_prompt_marker() {
        let fake = Fake { data: b"> ", pos: 0 };
        let mut reader = SerialReader::new(fake);
        let event = block_on(reader.next_event()).unwrap();
        assert_eq!(event, ReadEvent::Prompt);
    }

    #[test]
    fn reads_raw_payload_after_labelled_line() {
        let fake = Fake { data: b"+QIRD: 4\r\nabcd", pos: 0 };
        let mut reader = SerialReader::new(fake);
        let event = block_on(reader.next_event()).unwrap();
        assert_eq!(event, ReadEvent::Line);
        assert_eq!(reader.line(), b"+QIRD: 4");
        let mut payload = [0u8; 4];
        block_on(reader.read_raw(&mut payload)).unwrap();
        assert_eq!(&payload, b"abcd");
    }
}
