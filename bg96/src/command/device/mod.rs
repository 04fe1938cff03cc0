//! Device identity, functionality level, error-report verbosity, signal
//! quality and the modem's own real-time clock (§4.6, §6).

use core::fmt::Write as _;
use core::str::FromStr;

use heapless::String;
use jiff::civil::DateTime;
use jiff::tz::{Offset, TimeZone};
use jiff::{Timestamp, Zoned};

use crate::error::Error;
use crate::parser::{ArgExtractor, Element};

/// Anything below this is treated as an unset RTC (cold module, never
/// synced to the network).
const MODEM_MIN_VALID_TIMESTAMP: i64 = 1_672_531_200; // 2023-01-01T00:00:00Z

pub fn format_set_functionality(fun: u8) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+CFUN={fun}");
    out
}

pub fn format_set_cme_error_reports(verbose: bool) -> String<16> {
    let mut out = String::new();
    let _ = write!(out, "+CMEE={}", if verbose { 2 } else { 0 });
    out
}

pub fn format_get_clock() -> &'static str {
    "+CCLK?"
}

pub fn format_get_imei() -> &'static str {
    "+GSN"
}

pub fn format_get_iccid() -> &'static str {
    "+QCCID"
}

pub fn format_get_config(name: &str) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+QCFG=\"{name}\"");
    out
}

pub fn format_get_cell_info() -> &'static str {
    "+QENG=\"servingcell\""
}

pub fn format_get_signal_quality() -> &'static str {
    "+CSQ"
}

/// Current modem time, parsed from the `+CCLK?` response's
/// `yy/MM/dd,hh:mm:ss±zz` payload. The timezone field is quarter-hours
/// with sign; it is multiplied by 15 to get minutes, preserved exactly
/// per the source device's own encoding (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct RtcTime {
    pub time: Zoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockParseError {
    InvalidFormat,
}

impl FromStr for RtcTime {
    type Err = ClockParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < 20 {
            return Err(ClockParseError::InvalidFormat);
        }
        let date_time_str = &s[0..17];
        let tz_sign = s.chars().nth(17).ok_or(ClockParseError::InvalidFormat)?;
        let tz_offset_q: i32 = s[18..].parse().map_err(|_| ClockParseError::InvalidFormat)?;

        let offset_secs = match tz_sign {
            '-' => -tz_offset_q * 15 * 60,
            _ => tz_offset_q * 15 * 60,
        };
        let offset = Offset::from_seconds(offset_secs)
            .map_err(|_| ClockParseError::InvalidFormat)?
            .to_time_zone();

        let time = DateTime::strptime("%y/%m/%d,%H:%M:%S", date_time_str)
            .map_err(|_| ClockParseError::InvalidFormat)?
            .to_zoned(offset)
            .map_err(|_| ClockParseError::InvalidFormat)?;

        if time.timestamp().as_second() < MODEM_MIN_VALID_TIMESTAMP {
            Ok(Self { time: Zoned::new(Timestamp::UNIX_EPOCH, TimeZone::UTC) })
        } else {
            Ok(Self { time })
        }
    }
}

pub fn parse_clock(raw: &str) -> Result<RtcTime, Error> {
    let trimmed = raw.trim_matches('"');
    RtcTime::from_str(trimmed).map_err(|_| Error::Runtime)
}

/// Maps `+CSQ`'s `<rssi>` field: `99` means "unknown" (reported as `0`),
/// `0..=31` maps to `-113 + 2*n` dBm (§6).
pub fn rssi_dbm(raw_rssi: i64) -> i16 {
    if !(0..=31).contains(&raw_rssi) { 0 } else { (-113 + 2 * raw_rssi) as i16 }
}

/// Parses `+CSQ: <rssi>,<ber>` into its dBm value.
pub fn parse_signal_quality(args: &[u8]) -> Result<i16, Error> {
    let mut it = ArgExtractor::new(args);
    match it.next() {
        Some(Ok(Element::Int(rssi))) => Ok(rssi_dbm(rssi)),
        _ => Err(Error::TypeError),
    }
}

/// `+GSN`'s bare response is the IMEI digit string with no label.
pub fn parse_bare_string<const N: usize>(args: &[u8]) -> Result<String<N>, Error> {
    let text = core::str::from_utf8(args).map_err(|_| Error::TypeError)?.trim();
    String::try_from(text).map_err(|_| Error::TypeError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_clock_with_positive_offset() {
        let clock = parse_clock("24/05/30,13:22:45+08").unwrap();
        assert!(clock.time.timestamp().as_second() >= MODEM_MIN_VALID_TIMESTAMP);
        assert_eq!(clock.time.offset().seconds(), 8 * 15 * 60);
    }

    #[test]
    fn valid_clock_with_negative_offset() {
        let clock = parse_clock("24/05/30,13:22:45-04").unwrap();
        assert_eq!(clock.time.offset().seconds(), -4 * 15 * 60);
    }

    #[test]
    fn clock_below_epoch_threshold_collapses_to_unix_epoch() {
        let clock = parse_clock("20/01/01,00:00:00+00").unwrap();
        assert_eq!(clock.time.timestamp(), Timestamp::UNIX_EPOCH);
    }

    #[test]
    fn too_short_clock_string_is_rejected() {
        assert!(parse_clock("24/05/30,13:22").is_err());
    }

    #[test]
    fn rssi_maps_unknown_and_known_range() {
        assert_eq!(rssi_dbm(99), 0);
        assert_eq!(rssi_dbm(0), -113);
        assert_eq!(rssi_dbm(31), -51);
        assert_eq!(rssi_dbm(18), -77);
    }

    #[test]
    fn parses_signal_quality_line() {
        assert_eq!(parse_signal_quality(b"18,99").unwrap(), -77);
    }

    #[test]
    fn parses_bare_imei_string() {
        let imei: String<16> = parse_bare_string(b"865469040123456").unwrap();
        assert_eq!(&imei[..], "865469040123456");
    }
}
