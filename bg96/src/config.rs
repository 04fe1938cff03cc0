use heapless::String;
use serde::{Deserialize, Serialize};

/// PDP authentication method, mirrors `+QICSGP`'s `<auth>` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthMethod {
    None = 0,
    Pap = 1,
    Chap = 2,
    PapOrChap = 3,
}

/// Driver configuration, supplied once at construction.
///
/// There is no `std::env` or filesystem in a `no_std` driver: the
/// out-of-scope host-language binding layer is expected to decode this from
/// whatever configuration format that language prefers and hand it to
/// [`crate::Modem::new`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Access point name. Empty string lets the modem autodetect.
    pub apn: String<64>,
    pub user: String<32>,
    pub password: String<32>,
    pub auth: AuthMethod,
    /// PDP context / PSD profile id, almost always `1`.
    pub profile: u8,
    /// Number of socket slots to manage, 4-6.
    pub socket_count: u8,
    /// Timeout for most AT command slots.
    pub command_timeout_ms: u32,
    /// Window to wait for a `+QIOPEN`/`+QSSLOPEN` connect URC.
    pub connect_timeout_ms: u32,
    /// Window to wait for DNS resolution.
    pub dns_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            apn: String::new(),
            user: String::new(),
            password: String::new(),
            auth: AuthMethod::None,
            profile: 1,
            socket_count: 6,
            command_timeout_ms: 5_000,
            connect_timeout_ms: 150_000,
            dns_timeout_ms: 15_000,
        }
    }
}
