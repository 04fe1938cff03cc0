//! Per-domain AT command formatting and response parsing (§4.6).
//!
//! Every function here follows the same shape: format an AT line into a
//! caller-supplied buffer, or parse a slot's accumulated response bytes
//! into a typed value. None of them touch the serial port or the slot
//! arbiter directly — that orchestration lives in [`crate::modem`].

pub mod device;
pub mod gnss;
pub mod network;
pub mod pdp;
pub mod sms;
pub mod socket;
pub mod ssl_tls;
