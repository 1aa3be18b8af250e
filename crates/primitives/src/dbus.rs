#[cfg(test)]
#[path = "tests/dbus.rs"]
mod tests;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAX_NAME_LEN: usize = 255;

/// Participant names longer than this are hashed before encoding, keeping
/// the derived bus name under [`MAX_NAME_LEN`].
const MAX_ENCODED_INPUT: usize = 128;

const UNIQUE_PREFIX: &str = ":2.";

/// Endianness, type, flags, version, body length, serial and header field
/// array length.
const FIXED_HEADER_LEN: usize = 16;

/// The largest message the D-Bus wire protocol allows.
pub const MAX_MESSAGE_LEN: usize = 1 << 27;

/// A unique D-Bus connection name (`:x.y`) as seen on a tube's private bus.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct BusName(String);

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InvalidBusName {
    #[error("bus name is longer than {MAX_NAME_LEN} characters")]
    TooLong,
    #[error("bus name {0:?} is not a unique name")]
    NotUnique(String),
    #[error("bus name {0:?} contains invalid characters")]
    InvalidCharacters(String),
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum FramingError {
    #[error("invalid endianness marker {0:#04x}")]
    Endianness(u8),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("message of {0} bytes is too long")]
    TooLong(u64),
}

/// Total length of the D-Bus message at the start of `buf`, or `None` until
/// its fixed header has arrived.
pub fn message_len(buf: &[u8]) -> Result<Option<usize>, FramingError> {
    let Some(header) = buf.get(..FIXED_HEADER_LEN) else {
        return Ok(None);
    };

    let read: fn([u8; 4]) -> u32 = match header[0] {
        b'l' => u32::from_le_bytes,
        b'B' => u32::from_be_bytes,
        other => return Err(FramingError::Endianness(other)),
    };

    if header[3] != 1 {
        return Err(FramingError::Version(header[3]));
    }

    let body = read([header[4], header[5], header[6], header[7]]);
    let fields = read([header[12], header[13], header[14], header[15]]);

    // the header field array is padded to an 8 byte boundary before the body
    let header_len = (FIXED_HEADER_LEN as u64 + u64::from(fields)).next_multiple_of(8);
    let total = header_len + u64::from(body);

    match usize::try_from(total) {
        Ok(len) if len <= MAX_MESSAGE_LEN => Ok(Some(len)),
        _ => Err(FramingError::TooLong(total)),
    }
}

impl BusName {
    /// Derives the bus name a room participant uses on a room D-Bus tube.
    ///
    /// Every member computes the same name for the same participant.
    #[must_use]
    pub fn unique_for(participant: &str) -> Self {
        let encoded = if participant.len() > MAX_ENCODED_INPUT {
            bs58::encode(Sha256::digest(participant.as_bytes())).into_string()
        } else {
            bs58::encode(participant.as_bytes()).into_string()
        };

        Self(format!("{UNIQUE_PREFIX}{encoded}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BusName {
    type Err = InvalidBusName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_NAME_LEN {
            return Err(InvalidBusName::TooLong);
        }

        let Some(rest) = s.strip_prefix(':') else {
            return Err(InvalidBusName::NotUnique(s.to_owned()));
        };

        let valid = rest.split('.').count() >= 2
            && rest.split('.').all(|element| {
                !element.is_empty()
                    && element
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
            });

        if !valid {
            return Err(InvalidBusName::InvalidCharacters(s.to_owned()));
        }

        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for BusName {
    type Error = InvalidBusName;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BusName> for String {
    fn from(name: BusName) -> Self {
        name.0
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}
