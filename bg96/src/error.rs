use crate::parser::ParseError;
use crate::slot::SlotError;

/// Error taxonomy returned to client tasks.
///
/// The reader loop never raises; every failure surfaces here as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// A host argument did not parse; returned before any modem interaction.
    TypeError,
    /// Argument out of the supported enumeration (e.g. protocol other than TCP/UDP).
    Unsupported,
    /// The modem failed to answer during startup (auto-baud, PIN-ready, `+QINISTAT`).
    HardwareInit,
    /// A slot exceeded its timeout, prompt/buffer mode was never entered, a
    /// connect/bind URC was not seen within its window, or DNS did not
    /// resolve in time.
    Timeout,
    /// The modem returned `ERROR`/`+CME ERROR`, or a TLS configuration step failed.
    IoError,
    /// The connect URC reported a non-zero status.
    ConnectionRefused,
    /// Receive on a socket whose to-be-closed flag is set and whose ring
    /// buffer is empty.
    Closed,
    /// GNSS subsystem not running, or RTC read failed.
    Runtime,
    /// A non-blocking socket had no data ready.
    WouldBlock,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::TypeError => "argument did not parse",
            Error::Unsupported => "unsupported argument",
            Error::HardwareInit => "modem failed to initialise",
            Error::Timeout => "operation timed out",
            Error::IoError => "modem returned an error",
            Error::ConnectionRefused => "connection refused",
            Error::Closed => "socket closed",
            Error::Runtime => "runtime error",
            Error::WouldBlock => "operation would block",
        };
        f.write_str(msg)
    }
}

impl From<SlotError> for Error {
    fn from(err: SlotError) -> Self {
        match err {
            SlotError::Timeout => Error::Timeout,
            SlotError::Invalid => Error::IoError,
        }
    }
}

impl From<ParseError> for Error {
    fn from(_err: ParseError) -> Self {
        Error::TypeError
    }
}
