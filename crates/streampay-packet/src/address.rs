use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MAX_ADDRESS_LENGTH: usize = 1023;

static ALLOWED_SCHEMES: &[&str] = &[
    "g", "private", "example", "peer", "self", "test", "test1", "test2", "test3", "local",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("ILP address is too long: {0} bytes")]
    TooLong(usize),
    #[error("invalid ILP address scheme: {0}")]
    InvalidScheme(String),
    #[error("invalid ILP address segment: {0:?}")]
    InvalidSegment(String),
    #[error("ILP address needs a segment after the scheme: {0}")]
    TooFewSegments(String),
}

/// An ILP address: dot-separated segments of `[A-Za-z0-9_~-]`, the first of
/// which must be a known allocation scheme.
///
/// Addresses are validated on construction, so the accessors never fail.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address(Bytes);

impl Address {
    pub fn new(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() > MAX_ADDRESS_LENGTH {
            return Err(AddressError::TooLong(bytes.len()));
        }
        let string = std::str::from_utf8(bytes)
            .map_err(|_| AddressError::InvalidSegment(format!("{:?}", bytes)))?;
        let scheme = string.split('.').next().unwrap_or("");
        if !ALLOWED_SCHEMES.contains(&scheme) {
            return Err(AddressError::InvalidScheme(scheme.to_string()));
        }
        let mut num_segments = 0;
        for segment in string.split('.') {
            if segment.is_empty() || !segment.bytes().all(is_segment_byte) {
                return Err(AddressError::InvalidSegment(segment.to_string()));
            }
            num_segments += 1;
        }
        // a bare scheme is not an address
        if num_segments < 2 {
            return Err(AddressError::TooFewSegments(string.to_string()));
        }
        Ok(Address(Bytes::copy_from_slice(bytes)))
    }

    /// The allocation scheme, i.e. the first segment.
    pub fn scheme(&self) -> &str {
        self.as_str().split('.').next().unwrap_or("")
    }

    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.as_str().split('.')
    }

    /// Creates a new address with the given segment appended.
    pub fn with_suffix(&self, suffix: &[u8]) -> Result<Address, AddressError> {
        let mut bytes = Vec::with_capacity(self.0.len() + 1 + suffix.len());
        bytes.extend_from_slice(&self.0);
        bytes.push(b'.');
        bytes.extend_from_slice(suffix);
        Address::new(&bytes)
    }

    pub fn as_str(&self) -> &str {
        // Validated UTF-8 on construction
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn is_segment_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'~' || byte == b'-'
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        Address::new(string.as_bytes())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Address({})", self.as_str())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        Address::from_str(&string).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_addresses() {
        for valid in &[
            "g.acme.alice",
            "test.node",
            "private.bank-1.user_7~tilde",
            "peer.config",
        ] {
            assert!(Address::from_str(valid).is_ok(), "{}", valid);
        }
    }

    #[test]
    fn rejects_invalid_addresses() {
        assert_eq!(
            Address::from_str("gg.acme").unwrap_err(),
            AddressError::InvalidScheme("gg".to_string())
        );
        assert!(Address::from_str("g..alice").is_err());
        assert!(Address::from_str("g.acme.").is_err());
        assert!(Address::from_str("g.acme alice").is_err());
        assert!(Address::new(&vec![b'g'; 1024]).is_err());
    }

    #[test]
    fn rejects_a_bare_scheme() {
        assert_eq!(
            Address::from_str("test").unwrap_err(),
            AddressError::TooFewSegments("test".to_string())
        );
        assert_eq!(
            Address::from_str("g").unwrap_err(),
            AddressError::TooFewSegments("g".to_string())
        );
    }

    #[test]
    fn with_suffix_appends_a_segment() {
        let base = Address::from_str("test.node").unwrap();
        let suffixed = base.with_suffix(b"abc-123").unwrap();
        assert_eq!(suffixed.as_str(), "test.node.abc-123");
        assert_eq!(suffixed.segments().rev().next().unwrap(), "abc-123");
        assert!(base.with_suffix(b"bad segment").is_err());
    }
}
