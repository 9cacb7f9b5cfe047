//! Client platform identifiers.
//!
//! A platform tags every live connection and every authenticated request.
//! The numeric values are part of the wire contract (the `X-Platform` header
//! and the hub's routing keys) and must never be reordered.

use std::fmt;

/// Closed set of client platforms, transported as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Platform {
    Unspecified = 0,
    Android = 1,
    AndroidPad = 2,
    IPhone = 3,
    Mac = 4,
    IPad = 5,
    Windows = 6,
    Linux = 7,
    Web = 8,
    Harmony = 9,
}

impl Platform {
    /// Every concrete platform. `Unspecified` is a wildcard for routing
    /// operations ("all platforms of this user"), never a live connection key.
    pub const ALL: [Platform; 9] = [
        Platform::Android,
        Platform::AndroidPad,
        Platform::IPhone,
        Platform::Mac,
        Platform::IPad,
        Platform::Windows,
        Platform::Linux,
        Platform::Web,
        Platform::Harmony,
    ];

    /// Maps the wire integer back to a platform, `Unspecified` included.
    pub fn from_i8(value: i8) -> Option<Platform> {
        match value {
            0 => Some(Platform::Unspecified),
            1 => Some(Platform::Android),
            2 => Some(Platform::AndroidPad),
            3 => Some(Platform::IPhone),
            4 => Some(Platform::Mac),
            5 => Some(Platform::IPad),
            6 => Some(Platform::Windows),
            7 => Some(Platform::Linux),
            8 => Some(Platform::Web),
            9 => Some(Platform::Harmony),
            _ => None,
        }
    }

    /// Parses the decimal header form (`X-Platform: 8`).
    ///
    /// `Unspecified` is not a valid header value: a client must say what it is.
    pub fn parse_header(value: &str) -> Option<Platform> {
        value
            .trim()
            .parse::<i8>()
            .ok()
            .and_then(Platform::from_i8)
            .filter(|p| *p != Platform::Unspecified)
    }

    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as i8)
    }
}
