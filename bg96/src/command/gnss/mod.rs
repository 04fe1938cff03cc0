//! GNSS init/fix formatting and `+QGPSLOC` parsing (§4.6).

use core::fmt::Write as _;

use heapless::String;

use crate::error::Error;
use crate::parser::{ArgExtractor, Element};

/// One `+QGPSLOC=2` fix (§3 "GnssFix").
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GnssFix {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
    /// Speed over ground, km/h.
    pub speed_kmh: f32,
    /// Course over ground, already converted from deg.minutes to decimal
    /// degrees (see [`cog_to_decimal_degrees`]).
    pub course_deg: f32,
    pub hdop: f32,
    pub satellites: u8,
    /// `2` or `3` (2D/3D fix) as reported by `+QGPSLOC`'s `<fix>` field.
    pub fix_kind: u8,
}

pub fn format_set_nmea_source(use_uart3: bool) -> &'static str {
    if use_uart3 { r#"+QGPSCFG="nmeasrc",1"# } else { r#"+QGPSCFG="nmeasrc",0"# }
}

pub fn format_set_gnss_config() -> &'static str {
    r#"+QGPSCFG="gnssconfig",1"#
}

pub fn format_start(accuracy_m: u16, fix_max_time_s: u16, rate_s: u16) -> String<32> {
    let mut out = String::new();
    let _ = write!(out, "+QGPS=1,{fix_max_time_s},{accuracy_m},0,{rate_s}");
    out
}

pub fn format_set_output_port_uart_nmea() -> &'static str {
    r#"+QGPSCFG="outport","uartnmea""#
}

pub fn format_stop() -> &'static str {
    "+QGPSEND"
}

pub fn format_get_fix() -> &'static str {
    "+QGPSLOC=2"
}

/// Converts `+QGPSLOC`'s course-over-ground, reported as `deg.minutes`,
/// into decimal degrees: `int(cog) + (cog - int(cog)) * 10/6` (§4.6,
/// preserved exactly — see DESIGN.md). `cog` is always non-negative, so
/// truncation toward zero (the cast) is equivalent to `int()`.
pub fn cog_to_decimal_degrees(cog: f32) -> f32 {
    let whole = (cog as i32) as f32;
    whole + (cog - whole) * 10.0 / 6.0
}

fn element_as_f32(el: &Element<'_>) -> Option<f32> {
    match el {
        Element::Str(s) => s.parse().ok(),
        Element::Int(n) => Some(*n as f32),
    }
}

/// Parses the 11 comma-separated fields of a `+QGPSLOC=2` response:
/// `<utc>,<lat>,<lon>,<hdop>,<alt>,<fix>,<cog>,<spkm>,<spkn>,<date>,<nsat>`.
pub fn parse_fix(args: &[u8]) -> Result<GnssFix, Error> {
    let fields: heapless::Vec<Element<'_>, 12> = ArgExtractor::new(args).filter_map(Result::ok).collect();
    if fields.len() < 11 {
        return Err(Error::TypeError);
    }

    let utc = match fields[0] {
        Element::Str(s) => s,
        Element::Int(_) => return Err(Error::TypeError),
    };
    if utc.len() < 6 {
        return Err(Error::TypeError);
    }
    let hour: u8 = utc[0..2].parse().map_err(|_| Error::TypeError)?;
    let minute: u8 = utc[2..4].parse().map_err(|_| Error::TypeError)?;
    let second: u8 = utc[4..6].parse().map_err(|_| Error::TypeError)?;

    let latitude = element_as_f32(&fields[1]).ok_or(Error::TypeError)?;
    let longitude = element_as_f32(&fields[2]).ok_or(Error::TypeError)?;
    let hdop = element_as_f32(&fields[3]).ok_or(Error::TypeError)?;
    let altitude = element_as_f32(&fields[4]).ok_or(Error::TypeError)?;
    let fix_kind = match fields[5] {
        Element::Int(n) => n as u8,
        Element::Str(s) => s.parse().map_err(|_| Error::TypeError)?,
    };
    let cog = element_as_f32(&fields[6]).ok_or(Error::TypeError)?;
    let speed_kmh = element_as_f32(&fields[7]).ok_or(Error::TypeError)?;

    let date = match fields[9] {
        Element::Int(n) => n,
        Element::Str(s) => s.parse().map_err(|_| Error::TypeError)?,
    };
    let day = (date / 10000) as u8;
    let month = ((date / 100) % 100) as u8;
    let year = (date % 100) as u8;

    let satellites = match fields[10] {
        Element::Int(n) => n as u8,
        Element::Str(s) => s.parse().map_err(|_| Error::TypeError)?,
    };

    Ok(GnssFix {
        year,
        month,
        day,
        hour,
        minute,
        second,
        latitude,
        longitude,
        altitude,
        speed_kmh,
        course_deg: cog_to_decimal_degrees(cog),
        hdop,
        satellites,
        fix_kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_course_over_ground() {
        // 90.3 deg.minutes -> 90 + 0.3 * 10/6 = 90.5 decimal degrees
        let decimal = cog_to_decimal_degrees(90.3);
        assert!((decimal - 90.5).abs() < 0.001);
    }

    #[test]
    fn formats_start_sequence() {
        assert_eq!(&format_start(50, 30, 1)[..], "+QGPS=1,30,50,0,1");
    }

    #[test]
    fn parses_a_complete_fix() {
        let line = b"132045.000,31.123456,121.654321,1.2,25.4,3,90.3,12.5,6.7,300524,09";
        let fix = parse_fix(line).unwrap();
        assert_eq!((fix.hour, fix.minute, fix.second), (13, 20, 45));
        assert_eq!((fix.day, fix.month, fix.year), (30, 5, 24));
        assert_eq!(fix.satellites, 9);
        assert_eq!(fix.fix_kind, 3);
        assert!((fix.course_deg - 90.5).abs() < 0.001);
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_fix(b"132045.000,31.1,121.6").is_err());
    }
}
